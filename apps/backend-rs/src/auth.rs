use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: Option<String>,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser, AppError> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(AuthenticatedUser {
                id: user_id.to_string(),
                email: None,
            });
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
    })?;
    let secret = state.config.jwt_secret.as_deref().ok_or_else(|| {
        AppError::Dependency("Authentication is not configured. Set JWT_SECRET.".to_string())
    })?;

    verify_token(token, secret)
}

pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    Ok(require_user(state, headers).await?.id)
}

fn verify_token(token: &str, secret: &str) -> Result<AuthenticatedUser, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let data = decode::<AccessClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|error| {
            tracing::debug!(error = %error, "Rejected access token");
            AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
        })?;

    if uuid::Uuid::parse_str(&data.claims.sub).is_err() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token subject is not a user id.".to_string(),
        ));
    }
    Ok(AuthenticatedUser {
        id: data.claims.sub,
        email: data.claims.email,
    })
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::{bearer_token, require_user_id, verify_token};
    use crate::state::AppState;

    const USER: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn token(secret: &str, exp_offset: i64) -> String {
        let exp = chrono::Utc::now().timestamp() + exp_offset;
        encode(
            &Header::default(),
            &json!({"sub": USER, "email": "ops@example.com", "exp": exp}),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("token")
    }

    #[test]
    fn accepts_valid_tokens() {
        let user = verify_token(&token("test-secret", 600), "test-secret").expect("valid");
        assert_eq!(user.id, USER);
        assert_eq!(user.email.as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        assert!(verify_token(&token("other", 600), "test-secret").is_err());
        assert!(verify_token(&token("test-secret", -3600), "test-secret").is_err());
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let state = AppState::for_tests();
        let error = require_user_id(&state, &HeaderMap::new())
            .await
            .expect_err("no token");
        assert_eq!(error.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
