use std::time::Duration;

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::state::AppState;

const DB_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

async fn probe_database(state: &AppState) -> Option<bool> {
    let pool = state.db_pool.as_ref()?;
    let healthy = match tokio::time::timeout(DB_PROBE_TIMEOUT, sqlx::query("SELECT 1").fetch_one(pool)).await {
        Ok(Ok(_)) => true,
        Ok(Err(error)) => {
            tracing::error!(error = %error, "Health probe query failed");
            false
        }
        Err(_) => {
            tracing::error!(timeout_secs = DB_PROBE_TIMEOUT.as_secs(), "Health probe timed out");
            false
        }
    };
    Some(healthy)
}

/// `db` is `null` when no database is configured; that still counts as ok.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let db = probe_database(&state).await;
    let status = if db == Some(false) { "degraded" } else { "ok" };
    Json(json!({
        "status": status,
        "service": state.config.app_name,
        "storage": state.storage.backend_name(),
        "email": state.mailer.is_some(),
        "now": Utc::now().to_rfc3339(),
        "db": db,
    }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{routes::v1_router, state::AppState};

    #[tokio::test]
    async fn reports_ok_without_database() {
        let app = v1_router().with_state(AppState::for_tests());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 64 * 1024).await.expect("body");
        let json: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["status"], "ok");
        assert!(json["db"].is_null());
        assert_eq!(json["storage"], "memory");
    }
}
