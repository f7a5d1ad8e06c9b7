use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    db::db_pool,
    error::AppResult,
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, non_empty_patch, remove_nulls, serialize_to_map, validate_input, value_str,
        CreateExtraInput, ExtraPath, ExtrasQuery, UpdateExtraInput,
    },
    services::audit::{write_audit_log, AuditEntry},
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, ADMIN_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/rental-extras",
            axum::routing::get(list_extras).post(create_extra),
        )
        .route(
            "/rental-extras/{extra_id}",
            axum::routing::get(get_extra)
                .patch(update_extra)
                .delete(delete_extra),
        )
}

async fn list_extras(
    State(state): State<AppState>,
    Query(query): Query<ExtrasQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    if let Some(kind) = query.kind {
        filters.insert("kind".to_string(), json!(kind));
    }
    if let Some(active) = query.active {
        filters.insert("is_active".to_string(), json!(active));
    }
    let rows = list_rows(pool, "rental_extras", Some(&filters), clamp_limit(query.limit), 0, "name", true).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_extra(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateExtraInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_role(&state, &user_id, &payload.organization_id, ADMIN_ROLES).await?;
    let pool = db_pool(&state)?;

    let created = create_row(pool, "rental_extras", &remove_nulls(serialize_to_map(&payload))).await?;
    let extra_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "create", "rental_extras", &extra_id).after(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_extra(
    State(state): State<AppState>,
    Path(path): Path<ExtraPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let row = get_row(pool, "rental_extras", &path.extra_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    Ok(Json(row))
}

/// Price changes only affect new bookings; existing lines keep their snapshot.
async fn update_extra(
    State(state): State<AppState>,
    Path(path): Path<ExtraPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateExtraInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;
    let pool = db_pool(&state)?;
    let before = get_row(pool, "rental_extras", &path.extra_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, ADMIN_ROLES).await?;

    let updated = update_row(pool, "rental_extras", &path.extra_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "update", "rental_extras", &path.extra_id)
            .before(before)
            .after(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_extra(
    State(state): State<AppState>,
    Path(path): Path<ExtraPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "rental_extras", &path.extra_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&record)?, ADMIN_ROLES).await?;

    let deleted = delete_row(pool, "rental_extras", &path.extra_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "delete", "rental_extras", &path.extra_id).before(deleted.clone()),
    )
    .await;
    Ok(Json(deleted))
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
    async fn unknown_price_type_is_rejected() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::post("/rental-extras")
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"organization_id":"o1","kind":"extra","name":"Helmet","unit_price":3,"price_type":"hourly"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
