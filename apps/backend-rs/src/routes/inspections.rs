use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    auth::require_user_id,
    db::{acquire, begin, commit, db_pool},
    error::{AppError, AppResult},
    models::{Booking, InspectionKind},
    repository::table_service::{
        create_row, delete_row, delete_where, get_row, list_rows, lock_row, update_row,
    },
    routes::uploads::read_upload,
    schemas::{
        clamp_limit, non_empty_patch, remove_nulls, serialize_to_map, validate_input, value_str,
        CreateInspectionInput, InspectionPath, InspectionPhotoPath, InspectionsQuery,
        SendDocumentInput, UpdateInspectionInput,
    },
    services::{
        audit::{write_audit_log, write_audit_log_tx, AuditEntry},
        booking_data::load_booking,
        inspection_report::{render_inspection_pdf, send_inspection_report},
        storage::build_object_key,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, FRONT_DESK_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/inspections",
            axum::routing::get(list_inspections).post(create_inspection),
        )
        .route(
            "/inspections/{inspection_id}",
            axum::routing::get(get_inspection)
                .patch(update_inspection)
                .delete(delete_inspection),
        )
        .route(
            "/inspections/{inspection_id}/photos",
            axum::routing::get(list_photos).post(upload_photo),
        )
        .route(
            "/inspections/{inspection_id}/photos/{photo_id}",
            axum::routing::delete(delete_photo),
        )
        .route(
            "/inspections/{inspection_id}/pdf",
            axum::routing::get(inspection_pdf),
        )
        .route(
            "/inspections/{inspection_id}/send",
            axum::routing::post(send_inspection),
        )
}

fn inspection_filters(booking_id: &str, vehicle_id: &str, kind: InspectionKind) -> Map<String, Value> {
    let mut filters = Map::new();
    filters.insert("booking_id".to_string(), json!(booking_id));
    filters.insert("vehicle_id".to_string(), json!(vehicle_id));
    filters.insert("kind".to_string(), json!(kind.as_str()));
    filters
}

async fn ensure_vehicle_on_booking(conn: &mut PgConnection, booking: &Booking, vehicle_id: &str) -> Result<(), AppError> {
    let mut filters = Map::new();
    filters.insert("booking_id".to_string(), json!(booking.id));
    filters.insert("vehicle_id".to_string(), json!(vehicle_id));
    let links = list_rows(&mut *conn, "booking_vehicles", Some(&filters), 1, 0, "created_at", true).await?;
    if links.is_empty() {
        return Err(AppError::UnprocessableEntity(
            "The vehicle is not part of this booking.".to_string(),
        ));
    }
    Ok(())
}

async fn photos_of(conn: &mut PgConnection, inspection_id: &str) -> Result<Vec<Value>, AppError> {
    let mut filters = Map::new();
    filters.insert("inspection_id".to_string(), json!(inspection_id));
    list_rows(&mut *conn, "inspection_photos", Some(&filters), 100, 0, "created_at", true).await
}

async fn remove_blob(state: &AppState, key: &str) {
    if key.is_empty() {
        return;
    }
    if let Err(error) = state.storage.delete(key).await {
        tracing::warn!(storage_key = key, error = %error, "Could not delete stored photo");
    }
}

async fn list_inspections(
    State(state): State<AppState>,
    Query(query): Query<InspectionsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut filters = Map::new();

    let org_id = match (query.booking_id.as_deref(), query.org_id.as_deref()) {
        (Some(booking_id), _) => {
            let booking = get_row(db_pool(&state)?, "bookings", booking_id, "id").await?;
            filters.insert("booking_id".to_string(), json!(booking_id));
            row_org_id(&booking)?
        }
        (None, Some(org_id)) => org_id.to_string(),
        (None, None) => {
            return Err(AppError::BadRequest("Pass booking_id or org_id.".to_string()));
        }
    };
    let ctx = assert_org_member(&state, &user_id, &org_id).await?;
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    if let Some(vehicle_id) = query.vehicle_id.as_deref() {
        filters.insert("vehicle_id".to_string(), json!(vehicle_id));
    }
    if let Some(kind) = query.kind {
        filters.insert("kind".to_string(), json!(kind.as_str()));
    }

    let rows = list_rows(db_pool(&state)?, "inspections", Some(&filters), clamp_limit(query.limit), 0, "inspected_at", false).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_inspection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateInspectionInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let (_, booking) = load_booking(&mut tx, &payload.booking_id).await?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FRONT_DESK_ROLES).await?;
    ensure_vehicle_on_booking(&mut tx, &booking, &payload.vehicle_id).await?;

    let existing = list_rows(
        &mut *tx,
        "inspections",
        Some(&inspection_filters(&booking.id, &payload.vehicle_id, payload.kind)),
        1,
        0,
        "inspected_at",
        true,
    )
    .await?;
    if !existing.is_empty() {
        return Err(AppError::Conflict(format!(
            "A {} inspection already exists for this vehicle.",
            payload.kind.as_str()
        )));
    }

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(ctx.org_id));
    record.insert("booking_id".to_string(), json!(booking.id));
    record.insert("vehicle_id".to_string(), json!(payload.vehicle_id));
    record.insert("kind".to_string(), json!(payload.kind.as_str()));
    record.insert("damages".to_string(), json!(payload.damages));
    record.insert(
        "inspected_at".to_string(),
        json!(payload.inspected_at.unwrap_or_else(Utc::now)),
    );
    record.insert("inspected_by_user_id".to_string(), json!(ctx.user_id));
    if let Some(odometer) = payload.odometer_km {
        record.insert("odometer_km".to_string(), json!(odometer));
    }
    if let Some(fuel) = payload.fuel_level {
        record.insert("fuel_level".to_string(), json!(fuel));
    }
    if let Some(notes) = payload.notes.as_deref() {
        record.insert("notes".to_string(), json!(notes));
    }

    let counterpart_kind = match payload.kind {
        InspectionKind::Delivery => InspectionKind::Return,
        InspectionKind::Return => InspectionKind::Delivery,
    };
    let counterpart = list_rows(
        &mut *tx,
        "inspections",
        Some(&inspection_filters(&booking.id, &payload.vehicle_id, counterpart_kind)),
        1,
        0,
        "inspected_at",
        true,
    )
    .await?
    .into_iter()
    .next();

    if payload.kind == InspectionKind::Return {
        if let Some(delivery) = counterpart.as_ref() {
            record.insert("paired_inspection_id".to_string(), json!(value_str(delivery, "id")));
        }
    }
    let created = create_row(&mut *tx, "inspections", &record).await?;
    let inspection_id = value_str(&created, "id");

    // A delivery recorded after its return still gets paired.
    if payload.kind == InspectionKind::Delivery {
        if let Some(returned) = counterpart.filter(|row| row.get("paired_inspection_id").map_or(true, Value::is_null)) {
            let mut patch = Map::new();
            patch.insert("paired_inspection_id".to_string(), json!(inspection_id));
            update_row(&mut *tx, "inspections", &value_str(&returned, "id"), &patch, "id").await?;
        }
    }
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "create", "inspections", &inspection_id).after(created.clone()),
    )
    .await?;
    commit(tx).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_inspection(
    State(state): State<AppState>,
    Path(path): Path<InspectionPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let mut row = get_row(&mut *conn, "inspections", &path.inspection_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;

    let photos = photos_of(&mut conn, &path.inspection_id).await?;
    if let Some(obj) = row.as_object_mut() {
        obj.insert("photos".to_string(), Value::Array(photos));
    }
    Ok(Json(row))
}

async fn update_inspection(
    State(state): State<AppState>,
    Path(path): Path<InspectionPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateInspectionInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;
    let pool = db_pool(&state)?;
    let before = get_row(pool, "inspections", &path.inspection_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, FRONT_DESK_ROLES).await?;

    let updated = update_row(pool, "inspections", &path.inspection_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "update", "inspections", &path.inspection_id)
            .before(before)
            .after(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_inspection(
    State(state): State<AppState>,
    Path(path): Path<InspectionPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let record = lock_row(&mut tx, "inspections", &path.inspection_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&record)?, FRONT_DESK_ROLES).await?;

    let photos = photos_of(&mut tx, &path.inspection_id).await?;
    let mut photo_filters = Map::new();
    photo_filters.insert("inspection_id".to_string(), json!(path.inspection_id));
    delete_where(&mut *tx, "inspection_photos", &photo_filters).await?;

    let mut paired_filters = Map::new();
    paired_filters.insert("paired_inspection_id".to_string(), json!(path.inspection_id));
    let paired = list_rows(&mut *tx, "inspections", Some(&paired_filters), 10, 0, "inspected_at", true).await?;
    for returned in &paired {
        let mut patch = Map::new();
        patch.insert("paired_inspection_id".to_string(), Value::Null);
        update_row(&mut *tx, "inspections", &value_str(returned, "id"), &patch, "id").await?;
    }

    let deleted = delete_row(&mut *tx, "inspections", &path.inspection_id, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "delete", "inspections", &path.inspection_id).before(deleted.clone()),
    )
    .await?;
    commit(tx).await?;

    for photo in &photos {
        remove_blob(&state, &value_str(photo, "storage_key")).await;
    }
    Ok(Json(deleted))
}

async fn list_photos(
    State(state): State<AppState>,
    Path(path): Path<InspectionPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let inspection = get_row(&mut *conn, "inspections", &path.inspection_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&inspection)?).await?;
    Ok(Json(json!({ "data": photos_of(&mut conn, &path.inspection_id).await? })))
}

async fn upload_photo(
    State(state): State<AppState>,
    Path(path): Path<InspectionPath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let inspection = get_row(pool, "inspections", &path.inspection_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&inspection)?, FRONT_DESK_ROLES).await?;

    let upload = read_upload(multipart).await?;
    let label = upload.field("label").map(ToOwned::to_owned);
    let (_, file) = upload.require_file()?;
    if !file.content_type.starts_with("image/") {
        return Err(AppError::BadRequest("Inspection photos must be images.".to_string()));
    }

    let key = build_object_key(&ctx.org_id, "inspections", &path.inspection_id, &file.file_name);
    state
        .storage
        .put(&key, file.bytes, &file.content_type)
        .await?;

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(ctx.org_id));
    record.insert("inspection_id".to_string(), json!(path.inspection_id));
    record.insert("storage_key".to_string(), json!(key));
    record.insert("mime_type".to_string(), json!(file.content_type));
    record.insert("file_name".to_string(), json!(file.file_name));
    if let Some(label) = label {
        record.insert("label".to_string(), json!(label));
    }
    let created = match create_row(pool, "inspection_photos", &record).await {
        Ok(created) => created,
        Err(error) => {
            remove_blob(&state, &key).await;
            return Err(error);
        }
    };
    let photo_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "upload", "inspection_photos", &photo_id).after(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_photo(
    State(state): State<AppState>,
    Path(path): Path<InspectionPhotoPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let photo = get_row(pool, "inspection_photos", &path.photo_id, "id").await?;
    if value_str(&photo, "inspection_id") != path.inspection_id {
        return Err(AppError::NotFound("inspection_photos record not found.".to_string()));
    }
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&photo)?, FRONT_DESK_ROLES).await?;

    let deleted = delete_row(pool, "inspection_photos", &path.photo_id, "id").await?;
    remove_blob(&state, &value_str(&deleted, "storage_key")).await;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "delete", "inspection_photos", &path.photo_id).before(deleted.clone()),
    )
    .await;
    Ok(Json(deleted))
}

pub(crate) fn pdf_response(bytes: Vec<u8>, file_name: &str) -> Response {
    let disposition = HeaderValue::from_str(&format!("inline; filename=\"{file_name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("inline"));
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

async fn inspection_pdf(
    State(state): State<AppState>,
    Path(path): Path<InspectionPath>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let inspection = get_row(&mut *conn, "inspections", &path.inspection_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&inspection)?).await?;

    let pdf = render_inspection_pdf(&state, &mut conn, &path.inspection_id).await?;
    Ok(pdf_response(pdf.bytes, &pdf.file_name))
}

async fn send_inspection(
    State(state): State<AppState>,
    Path(path): Path<InspectionPath>,
    headers: HeaderMap,
    payload: Option<Json<SendDocumentInput>>,
) -> AppResult<Json<Value>> {
    let payload = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let inspection = get_row(&mut *conn, "inspections", &path.inspection_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&inspection)?, FRONT_DESK_ROLES).await?;

    let outcome = send_inspection_report(&state, &mut conn, &path.inspection_id, payload.recipient.as_deref()).await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "send", "inspections", &path.inspection_id).after(json!(outcome)),
    )
    .await;
    Ok(Json(json!(outcome)))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::{pdf_response, router};
    use crate::state::AppState;

    #[tokio::test]
    async fn pdf_responses_are_inline_pdfs() {
        let response = pdf_response(b"%PDF-1.4\n".to_vec(), "inspection-delivery-i1.pdf");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"inspection-delivery-i1.pdf\""
        );
        let body = to_bytes(response.into_body(), 1024).await.expect("body");
        assert!(body.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn listing_needs_a_scope() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::get("/inspections")
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn fuel_level_is_a_percentage() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::patch("/inspections/i1")
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"fuel_level":140}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
