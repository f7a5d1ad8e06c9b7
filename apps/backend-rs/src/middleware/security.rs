use axum::{
    extract::{Request, State},
    http::header::HOST,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, state::AppState};

fn host_without_port(raw: &str) -> &str {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    raw.rsplit_once(':').map_or(raw, |(host, _)| host)
}

pub fn host_allowed(trusted: &[String], host: &str) -> bool {
    if trusted.is_empty() {
        return true;
    }
    let host = host_without_port(host).to_ascii_lowercase();
    trusted.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" {
            return true;
        }
        match pattern.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{suffix}")),
            None => host == pattern,
        }
    })
}

/// Rejects requests whose Host header is not in TRUSTED_HOSTS (empty list allows all).
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !host_allowed(&state.config.trusted_hosts, host) {
        tracing::warn!(host, "Rejected request for untrusted host");
        return AppError::BadRequest("Invalid host header.".to_string()).into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::host_allowed;

    #[test]
    fn matches_exact_and_wildcard_hosts() {
        let trusted = vec!["api.fleetdesk.app".to_string(), "*.fleetdesk.dev".to_string()];
        assert!(host_allowed(&trusted, "api.fleetdesk.app:443"));
        assert!(host_allowed(&trusted, "staging.fleetdesk.dev"));
        assert!(!host_allowed(&trusted, "fleetdesk.dev.evil.com"));
        assert!(!host_allowed(&trusted, ""));
        assert!(host_allowed(&[], "anything"));
    }
}
