use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    db::db_pool,
    error::{AppError, AppResult},
    models::{from_row, Vehicle},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    routes::{local_today, uploads::read_upload},
    schemas::{
        clamp_limit, non_empty_patch, remove_nulls, serialize_to_map, validate_input, value_str,
        CreateVehicleInput, OrgQuery, UpdateVehicleInput, VehicleDocumentPath,
        VehicleDocumentType, VehiclePath, VehiclesQuery,
    },
    services::{
        audit::{write_audit_log, AuditEntry},
        maintenance::compliance,
        storage::build_object_key,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, ADMIN_ROLES, FRONT_DESK_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/vehicles",
            axum::routing::get(list_vehicles).post(create_vehicle),
        )
        .route("/vehicles/alerts", axum::routing::get(vehicle_alerts))
        .route(
            "/vehicles/{vehicle_id}",
            axum::routing::get(get_vehicle)
                .patch(update_vehicle)
                .delete(delete_vehicle),
        )
        .route(
            "/vehicles/{vehicle_id}/documents",
            axum::routing::get(list_documents).post(upload_document),
        )
        .route(
            "/vehicles/{vehicle_id}/documents/{document_id}",
            axum::routing::delete(delete_document),
        )
}

fn with_compliance(mut row: Value, today: NaiveDate) -> Result<Value, AppError> {
    let vehicle: Vehicle = from_row(&row, "vehicles")?;
    let report = compliance(&vehicle, today);
    if let Some(obj) = row.as_object_mut() {
        obj.insert("compliance".to_string(), json!(report));
        obj.insert("needs_attention".to_string(), json!(report.needs_attention()));
    }
    Ok(row)
}

async fn list_vehicles(
    State(state): State<AppState>,
    Query(query): Query<VehiclesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    if let Some(status) = query.status {
        filters.insert("status".to_string(), json!(status));
    }
    if let Some(vehicle_type) = query.vehicle_type {
        filters.insert("vehicle_type".to_string(), json!(vehicle_type));
    }
    if let Some(group) = query.vehicle_group.as_deref() {
        filters.insert("vehicle_group".to_string(), json!(group));
    }
    let rows = list_rows(pool, "vehicles", Some(&filters), clamp_limit(query.limit), 0, "registration", true).await?;
    let today = local_today(&state, None);
    let data = rows
        .into_iter()
        .map(|row| with_compliance(row, today))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(json!({ "data": data })))
}

/// Vehicles whose insurance or ITV is expired or about to expire.
async fn vehicle_alerts(
    State(state): State<AppState>,
    Query(query): Query<OrgQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    filters.insert("status__ne".to_string(), json!("inactive"));
    let rows = list_rows(pool, "vehicles", Some(&filters), 1000, 0, "registration", true).await?;
    let today = local_today(&state, None);

    let mut data = Vec::new();
    for row in rows {
        let row = with_compliance(row, today)?;
        if row.get("needs_attention").and_then(Value::as_bool) == Some(true) {
            data.push(row);
        }
    }
    Ok(Json(json!({ "data": data, "count": data.len() })))
}

async fn create_vehicle(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateVehicleInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_role(&state, &user_id, &payload.organization_id, ADMIN_ROLES).await?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "registration".to_string(),
        json!(normalize_registration(&payload.registration)),
    );
    let created = create_row(pool, "vehicles", &record).await?;
    let vehicle_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "create", "vehicles", &vehicle_id).after(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(with_compliance(created, local_today(&state, None))?)))
}

/// Plates are stored upper-case without spaces so the per-org unique index bites.
fn normalize_registration(raw: &str) -> String {
    raw.split_whitespace().collect::<String>().to_ascii_uppercase()
}

async fn get_vehicle(
    State(state): State<AppState>,
    Path(path): Path<VehiclePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let row = get_row(pool, "vehicles", &path.vehicle_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    Ok(Json(with_compliance(row, local_today(&state, None))?))
}

async fn update_vehicle(
    State(state): State<AppState>,
    Path(path): Path<VehiclePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateVehicleInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let before = get_row(pool, "vehicles", &path.vehicle_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, FRONT_DESK_ROLES).await?;

    let mut patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;
    if let Some(registration) = payload.registration.as_deref() {
        patch.insert(
            "registration".to_string(),
            json!(normalize_registration(registration)),
        );
    }
    let updated = update_row(pool, "vehicles", &path.vehicle_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "update", "vehicles", &path.vehicle_id)
            .before(before)
            .after(updated.clone()),
    )
    .await;
    Ok(Json(with_compliance(updated, local_today(&state, None))?))
}

async fn delete_vehicle(
    State(state): State<AppState>,
    Path(path): Path<VehiclePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "vehicles", &path.vehicle_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&record)?, ADMIN_ROLES).await?;

    let deleted = delete_row(pool, "vehicles", &path.vehicle_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "delete", "vehicles", &path.vehicle_id).before(deleted.clone()),
    )
    .await;
    Ok(Json(deleted))
}

async fn list_documents(
    State(state): State<AppState>,
    Path(path): Path<VehiclePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let vehicle = get_row(pool, "vehicles", &path.vehicle_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&vehicle)?).await?;

    let mut filters = Map::new();
    filters.insert("vehicle_id".to_string(), json!(path.vehicle_id));
    let rows = list_rows(pool, "vehicle_documents", Some(&filters), 200, 0, "created_at", false).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn upload_document(
    State(state): State<AppState>,
    Path(path): Path<VehiclePath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let vehicle = get_row(pool, "vehicles", &path.vehicle_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&vehicle)?, FRONT_DESK_ROLES).await?;

    let upload = read_upload(multipart).await?;
    let document_type = upload
        .field("document_type")
        .map_or(Some(VehicleDocumentType::Other), VehicleDocumentType::parse)
        .ok_or_else(|| {
            AppError::UnprocessableEntity(
                "document_type must be one of registration_certificate, insurance_policy, itv_certificate, other."
                    .to_string(),
            )
        })?;
    let expires_on = upload
        .field("expires_on")
        .map(|raw| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                AppError::UnprocessableEntity("expires_on must be YYYY-MM-DD.".to_string())
            })
        })
        .transpose()?;
    let (_, file) = upload.require_file()?;

    let key = build_object_key(&ctx.org_id, "vehicles", &path.vehicle_id, &file.file_name);
    state
        .storage
        .put(&key, file.bytes, &file.content_type)
        .await?;

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(ctx.org_id));
    record.insert("vehicle_id".to_string(), json!(path.vehicle_id));
    record.insert("document_type".to_string(), json!(document_type.as_str()));
    record.insert("storage_key".to_string(), json!(key));
    record.insert("mime_type".to_string(), json!(file.content_type));
    record.insert("file_name".to_string(), json!(file.file_name));
    if let Some(date) = expires_on {
        record.insert("expires_on".to_string(), json!(date));
    }
    let created = match create_row(pool, "vehicle_documents", &record).await {
        Ok(created) => created,
        Err(error) => {
            if let Err(cleanup) = state.storage.delete(&key).await {
                tracing::warn!(storage_key = %key, error = %cleanup, "Orphaned vehicle document");
            }
            return Err(error);
        }
    };
    let document_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "upload", "vehicle_documents", &document_id).after(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(path): Path<VehicleDocumentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let document = get_row(pool, "vehicle_documents", &path.document_id, "id").await?;
    if value_str(&document, "vehicle_id") != path.vehicle_id {
        return Err(AppError::NotFound("vehicle_documents record not found.".to_string()));
    }
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&document)?, FRONT_DESK_ROLES).await?;

    let deleted = delete_row(pool, "vehicle_documents", &path.document_id, "id").await?;
    let key = value_str(&deleted, "storage_key");
    if let Err(error) = state.storage.delete(&key).await {
        tracing::warn!(storage_key = %key, error = %error, "Could not delete stored file");
    }
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "delete", "vehicle_documents", &path.document_id).before(deleted.clone()),
    )
    .await;
    Ok(Json(deleted))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{normalize_registration, with_compliance};

    #[test]
    fn registrations_are_normalized() {
        assert_eq!(normalize_registration(" 1234 abc "), "1234ABC");
    }

    #[test]
    fn rows_carry_compliance() {
        let row = json!({
            "id": "v1",
            "organization_id": "o1",
            "registration": "1234ABC",
            "status": "active",
            "insurance_expiry": "2026-06-10",
            "itv_expiry": "2027-01-01",
        });
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let decorated = with_compliance(row, today).expect("vehicle row");
        assert_eq!(decorated["compliance"]["insurance"], "expiring_soon");
        assert_eq!(decorated["compliance"]["itv"], "valid");
        assert_eq!(decorated["needs_attention"], true);
    }
}
