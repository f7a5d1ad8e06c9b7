use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    db::{acquire, db_pool},
    error::AppResult,
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        check_tiers, check_window, clamp_limit, non_empty_patch, remove_nulls, serialize_to_map,
        validate_input, value_str, CreatePricingGroupInput, OrgQuery, PricingGroupPath,
        QuoteInput, UpdatePricingGroupInput,
    },
    services::{
        audit::{write_audit_log, AuditEntry},
        quote::{build_quote, QuoteRequest},
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, ADMIN_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/pricing-groups",
            axum::routing::get(list_groups).post(create_group),
        )
        .route(
            "/pricing-groups/{group_id}",
            axum::routing::get(get_group)
                .patch(update_group)
                .delete(delete_group),
        )
        .route("/pricing/quote", axum::routing::post(quote))
}

async fn list_groups(
    State(state): State<AppState>,
    Query(query): Query<OrgQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    let rows = list_rows(pool, "pricing_groups", Some(&filters), clamp_limit(query.limit), 0, "vehicle_group", true).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePricingGroupInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    check_tiers(&payload.tiers)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_role(&state, &user_id, &payload.organization_id, ADMIN_ROLES).await?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "pricing_groups", &record).await?;
    let group_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "create", "pricing_groups", &group_id).after(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_group(
    State(state): State<AppState>,
    Path(path): Path<PricingGroupPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let row = get_row(pool, "pricing_groups", &path.group_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    Ok(Json(row))
}

async fn update_group(
    State(state): State<AppState>,
    Path(path): Path<PricingGroupPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePricingGroupInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    if let Some(tiers) = payload.tiers.as_deref() {
        check_tiers(tiers)?;
    }
    let user_id = require_user_id(&state, &headers).await?;
    let patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;
    let pool = db_pool(&state)?;
    let before = get_row(pool, "pricing_groups", &path.group_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, ADMIN_ROLES).await?;

    let updated = update_row(pool, "pricing_groups", &path.group_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "update", "pricing_groups", &path.group_id)
            .before(before)
            .after(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_group(
    State(state): State<AppState>,
    Path(path): Path<PricingGroupPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "pricing_groups", &path.group_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&record)?, ADMIN_ROLES).await?;

    let deleted = delete_row(pool, "pricing_groups", &path.group_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "delete", "pricing_groups", &path.group_id).before(deleted.clone()),
    )
    .await;
    Ok(Json(deleted))
}

async fn quote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<QuoteInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    check_window(payload.pickup_at, payload.return_at)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &payload.org_id).await?;

    let mut conn = acquire(&state).await?;
    let quote = build_quote(
        &mut conn,
        QuoteRequest {
            org_id: &ctx.org_id,
            vehicle_ids: &payload.vehicle_ids,
            pickup_at: payload.pickup_at,
            return_at: payload.return_at,
            extras: &payload.extras,
            upgrades: &payload.upgrades,
            include_insurance: payload.include_insurance,
            discount: payload.discount(),
            grace_minutes: state.config.pickup_grace_minutes,
        },
    )
    .await?;
    Ok(Json(json!(quote)))
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

    async fn post_json(uri: &str, body: &str) -> StatusCode {
        router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::post(uri)
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response")
            .status()
    }

    #[tokio::test]
    async fn duplicate_tiers_are_rejected() {
        let status = post_json(
            "/pricing-groups",
            r#"{"organization_id":"00000000-0000-0000-0000-0000000000aa","vehicle_group":"car-b",
                "tiers":[{"days":1,"price":40},{"days":1,"price":35}]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn quote_window_must_move_forward() {
        let status = post_json(
            "/pricing/quote",
            r#"{"org_id":"00000000-0000-0000-0000-0000000000aa","vehicle_ids":["v1"],
                "pickup_at":"2026-07-03T10:00:00Z","return_at":"2026-07-01T10:00:00Z"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
