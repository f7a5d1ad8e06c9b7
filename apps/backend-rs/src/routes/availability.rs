use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    db::db_pool,
    error::AppResult,
    models::VehicleStatus,
    repository::table_service::list_rows,
    schemas::{check_window, value_str, AvailabilityQuery},
    services::availability::{blocking_windows, free_vehicle_ids, load_booked_windows},
    state::AppState,
    tenancy::assert_org_member,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/availability", axum::routing::get(availability))
}

async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    check_window(query.pickup_at, query.return_at)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    filters.insert("status".to_string(), json!(VehicleStatus::Active.as_str()));
    if let Some(vehicle_type) = query.vehicle_type {
        filters.insert("vehicle_type".to_string(), json!(vehicle_type));
    }
    let vehicles = list_rows(pool, "vehicles", Some(&filters), 1000, 0, "registration", true).await?;
    let vehicle_ids = vehicles
        .iter()
        .map(|vehicle| value_str(vehicle, "id"))
        .collect::<Vec<_>>();

    let windows = load_booked_windows(pool, &ctx.org_id, None, query.pickup_at, query.return_at).await?;
    let exclude = query.exclude_booking_id.as_deref();
    let free = free_vehicle_ids(&vehicle_ids, &windows, query.pickup_at, query.return_at, exclude);
    let busy = blocking_windows(&windows, query.pickup_at, query.return_at, exclude).collect::<Vec<_>>();

    let available = vehicles
        .into_iter()
        .filter(|vehicle| free.contains(&value_str(vehicle, "id")))
        .collect::<Vec<_>>();
    Ok(Json(json!({
        "pickup_at": query.pickup_at,
        "return_at": query.return_at,
        "data": available,
        "blocked": busy,
    })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::router;
    use crate::state::AppState;

    #[tokio::test]
    async fn inverted_window_is_rejected() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::get(
                    "/availability?org_id=o1&pickup_at=2026-07-03T10:00:00Z&return_at=2026-07-03T10:00:00Z",
                )
                .body(Body::empty())
                .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
