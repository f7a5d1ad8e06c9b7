use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_user, require_user_id},
    db::{begin, commit, db_pool},
    error::AppResult,
    repository::table_service::{create_row, get_row, update_row},
    schemas::{
        check_slug, non_empty_patch, remove_nulls, serialize_to_map, validate_input, value_str,
        CreateOrganizationInput, OrgPath, UpdateOrganizationInput,
    },
    services::audit::{write_audit_log, write_audit_log_tx, AuditEntry},
    state::AppState,
    tenancy::{
        add_org_member, assert_org_member, assert_org_role, ensure_app_user,
        list_user_organizations, OrgContext, ADMIN_ROLES, ROLE_OWNER_ADMIN,
    },
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/organizations",
            axum::routing::get(list_organizations).post(create_organization),
        )
        .route(
            "/organizations/{org_id}",
            axum::routing::get(get_organization).patch(update_organization),
        )
}

async fn list_organizations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let rows = list_user_organizations(&state, &user.id).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateOrganizationInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    check_slug(payload.org_slug.as_deref())?;
    let user = require_user(&state, &headers).await?;
    ensure_app_user(&state, &user.id, user.email.as_deref()).await?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record
        .entry("timezone")
        .or_insert_with(|| json!(state.config.default_timezone));

    let mut tx = begin(&state).await?;
    let created = create_row(&mut *tx, "organizations", &record).await?;
    let org_id = value_str(&created, "id");
    add_org_member(&mut tx, &org_id, &user.id, ROLE_OWNER_ADMIN).await?;
    let ctx = OrgContext {
        user_id: user.id.clone(),
        org_id: org_id.clone(),
        role: ROLE_OWNER_ADMIN.to_string(),
    };
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "create", "organizations", &org_id).after(created.clone()),
    )
    .await?;
    commit(tx).await?;

    state
        .org_membership_cache
        .insert((user.id, org_id), ROLE_OWNER_ADMIN.to_string())
        .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_organization(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &path.org_id).await?;
    let pool = db_pool(&state)?;
    let mut row = get_row(pool, "organizations", &ctx.org_id, "id").await?;
    if let Some(obj) = row.as_object_mut() {
        obj.insert("role".to_string(), json!(ctx.role));
    }
    Ok(Json(row))
}

async fn update_organization(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateOrganizationInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    check_slug(payload.org_slug.as_deref())?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_role(&state, &user_id, &path.org_id, ADMIN_ROLES).await?;
    let pool = db_pool(&state)?;

    let before = get_row(pool, "organizations", &ctx.org_id, "id").await?;
    let patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;
    let updated = update_row(pool, "organizations", &ctx.org_id, &patch, "id").await?;

    for slug in [value_str(&before, "org_slug"), value_str(&updated, "org_slug")] {
        if !slug.is_empty() {
            state.public_org_cache.invalidate(&slug).await;
        }
    }
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "update", "organizations", &ctx.org_id)
            .before(before)
            .after(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use crate::{routes::v1_router, state::AppState};

    #[tokio::test]
    async fn listing_requires_a_caller() {
        let app = v1_router().with_state(AppState::for_tests());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/organizations")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn org_ids_must_be_uuids() {
        let app = v1_router().with_state(AppState::for_tests());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/organizations/not-a-uuid")
                    .header("x-user-id", "3f0e8f8e-2c4e-4b8e-9d7a-111111111111")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
