use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Row};

use crate::{
    auth::require_user_id,
    db::{begin, commit, db_pool},
    error::{AppError, AppResult},
    models::{from_row, Customer, CustomerDocumentType},
    repository::table_service::{create_row, delete_row, delete_where, get_row, list_rows, update_row},
    routes::{local_today, uploads::read_upload},
    schemas::{
        clamp_limit, non_empty_opt, non_empty_patch, remove_nulls, serialize_to_map,
        validate_input, value_str, CreateCustomerInput, CustomerDocumentPath, CustomerPath,
        CustomersQuery, UpdateCustomerInput,
    },
    services::{
        audit::{write_audit_log, write_audit_log_tx, AuditEntry},
        customer_profile::decorate_customer,
        storage::build_object_key,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, FRONT_DESK_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/customers",
            axum::routing::get(list_customers).post(create_customer),
        )
        .route(
            "/customers/{customer_id}",
            axum::routing::get(get_customer)
                .patch(update_customer)
                .delete(delete_customer),
        )
        .route(
            "/customers/{customer_id}/documents",
            axum::routing::get(list_documents).post(upload_document),
        )
        .route(
            "/customers/{customer_id}/documents/{document_id}",
            axum::routing::delete(delete_document),
        )
}

async fn search_customers(
    pool: &PgPool,
    org_id: &str,
    term: Option<&str>,
    limit: i64,
) -> AppResult<Vec<Value>> {
    let pattern = term.map(|term| format!("%{}%", term.replace('%', "\\%").replace('_', "\\_")));
    let rows = sqlx::query(
        "SELECT row_to_json(c) AS row
         FROM customers c
         WHERE c.organization_id = $1::uuid
           AND ($2::text IS NULL
                OR c.full_name ILIKE $2
                OR c.email ILIKE $2
                OR c.phone_e164 ILIKE $2
                OR c.national_id ILIKE $2
                OR c.passport_number ILIKE $2)
         ORDER BY c.full_name ASC
         LIMIT $3",
    )
    .bind(org_id)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|error| {
        tracing::error!(org_id, error = %error, "Customer search failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect())
}

/// Adds completeness and documents to each customer row.
async fn decorate_rows(pool: &PgPool, rows: Vec<Value>, today: NaiveDate) -> AppResult<Vec<Value>> {
    if rows.is_empty() {
        return Ok(rows);
    }
    let ids = rows
        .iter()
        .map(|row| json!(value_str(row, "id")))
        .collect::<Vec<_>>();
    let mut filters = Map::new();
    filters.insert("customer_id".to_string(), Value::Array(ids));
    let documents = list_rows(pool, "customer_documents", Some(&filters), 1000, 0, "created_at", true).await?;

    let mut by_customer: HashMap<String, Vec<Value>> = HashMap::new();
    for document in documents {
        by_customer
            .entry(value_str(&document, "customer_id"))
            .or_default()
            .push(document);
    }

    rows.into_iter()
        .map(|row| {
            let customer: Customer = from_row(&row, "customers")?;
            let documents = by_customer.remove(&customer.id).unwrap_or_default();
            let present = documents
                .iter()
                .filter_map(|document| CustomerDocumentType::parse(&value_str(document, "document_type")))
                .collect::<HashSet<_>>();
            Ok(decorate_customer(row, &customer, documents, &present, today))
        })
        .collect()
}

async fn decorate_one(state: &AppState, pool: &PgPool, row: Value) -> AppResult<Value> {
    let today = local_today(state, None);
    decorate_rows(pool, vec![row], today)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Internal("Customer decoration returned nothing.".to_string()))
}

async fn list_customers(
    State(state): State<AppState>,
    Query(query): Query<CustomersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let term = non_empty_opt(query.search.as_deref());
    let rows = search_customers(pool, &ctx.org_id, term.as_deref(), clamp_limit(query.limit)).await?;
    let data = decorate_rows(pool, rows, local_today(&state, None)).await?;
    Ok(Json(json!({ "data": data })))
}

async fn create_customer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCustomerInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_role(&state, &user_id, &payload.organization_id, FRONT_DESK_ROLES).await?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "customers", &record).await?;
    let customer_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "create", "customers", &customer_id).after(created.clone()),
    )
    .await;
    let decorated = decorate_one(&state, pool, created).await?;
    Ok((StatusCode::CREATED, Json(decorated)))
}

async fn get_customer(
    State(state): State<AppState>,
    Path(path): Path<CustomerPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let row = get_row(pool, "customers", &path.customer_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    Ok(Json(decorate_one(&state, pool, row).await?))
}

async fn update_customer(
    State(state): State<AppState>,
    Path(path): Path<CustomerPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateCustomerInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let before = get_row(pool, "customers", &path.customer_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, FRONT_DESK_ROLES).await?;

    let patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;
    let updated = update_row(pool, "customers", &path.customer_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "update", "customers", &path.customer_id)
            .before(before)
            .after(updated.clone()),
    )
    .await;
    Ok(Json(decorate_one(&state, pool, updated).await?))
}

async fn delete_customer(
    State(state): State<AppState>,
    Path(path): Path<CustomerPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "customers", &path.customer_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&record)?, FRONT_DESK_ROLES).await?;

    let mut filters = Map::new();
    filters.insert("customer_id".to_string(), json!(path.customer_id));
    let documents = list_rows(pool, "customer_documents", Some(&filters), 100, 0, "created_at", true).await?;

    let mut tx = begin(&state).await?;
    delete_where(&mut *tx, "customer_documents", &filters).await?;
    let deleted = delete_row(&mut *tx, "customers", &path.customer_id, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "delete", "customers", &path.customer_id).before(deleted.clone()),
    )
    .await?;
    commit(tx).await?;

    for document in &documents {
        remove_blob(&state, &value_str(document, "storage_key")).await;
    }
    Ok(Json(deleted))
}

async fn remove_blob(state: &AppState, key: &str) {
    if key.is_empty() {
        return;
    }
    if let Err(error) = state.storage.delete(key).await {
        tracing::warn!(storage_key = key, error = %error, "Could not delete stored file");
    }
}

async fn list_documents(
    State(state): State<AppState>,
    Path(path): Path<CustomerPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let customer = get_row(pool, "customers", &path.customer_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&customer)?).await?;

    let mut filters = Map::new();
    filters.insert("customer_id".to_string(), json!(path.customer_id));
    let rows = list_rows(pool, "customer_documents", Some(&filters), 100, 0, "created_at", true).await?;
    Ok(Json(json!({ "data": rows })))
}

/// One current document per type: an upload replaces the previous file.
async fn upload_document(
    State(state): State<AppState>,
    Path(path): Path<CustomerPath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let customer = get_row(pool, "customers", &path.customer_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&customer)?, FRONT_DESK_ROLES).await?;

    let upload = read_upload(multipart).await?;
    let document_type = upload
        .field("document_type")
        .and_then(CustomerDocumentType::parse)
        .ok_or_else(|| {
            AppError::UnprocessableEntity(
                "document_type must be one of id_front, id_back, passport, driver_license_front, driver_license_back."
                    .to_string(),
            )
        })?;
    let (_, file) = upload.require_file()?;

    let key = build_object_key(&ctx.org_id, "customers", &path.customer_id, &file.file_name);
    state
        .storage
        .put(&key, file.bytes, &file.content_type)
        .await?;

    let mut filters = Map::new();
    filters.insert("customer_id".to_string(), json!(path.customer_id));
    filters.insert("document_type".to_string(), json!(document_type.as_str()));

    let result = async {
        let mut tx = begin(&state).await?;
        let replaced = list_rows(&mut *tx, "customer_documents", Some(&filters), 10, 0, "created_at", true).await?;
        delete_where(&mut *tx, "customer_documents", &filters).await?;

        let mut record = Map::new();
        record.insert("organization_id".to_string(), json!(ctx.org_id));
        record.insert("customer_id".to_string(), json!(path.customer_id));
        record.insert("document_type".to_string(), json!(document_type.as_str()));
        record.insert("storage_key".to_string(), json!(key));
        record.insert("mime_type".to_string(), json!(file.content_type));
        record.insert("file_name".to_string(), json!(file.file_name));
        record.insert("uploaded_by_user_id".to_string(), json!(ctx.user_id));
        let created = create_row(&mut *tx, "customer_documents", &record).await?;

        let document_id = value_str(&created, "id");
        write_audit_log_tx(
            &mut tx,
            AuditEntry::new(&ctx, "upload", "customer_documents", &document_id).after(created.clone()),
        )
        .await?;
        commit(tx).await?;
        Ok::<_, AppError>((created, replaced))
    }
    .await;

    let (created, replaced) = match result {
        Ok(done) => done,
        Err(error) => {
            remove_blob(&state, &key).await;
            return Err(error);
        }
    };
    for old in &replaced {
        remove_blob(&state, &value_str(old, "storage_key")).await;
    }
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(path): Path<CustomerDocumentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let document = get_row(pool, "customer_documents", &path.document_id, "id").await?;
    if value_str(&document, "customer_id") != path.customer_id {
        return Err(AppError::NotFound("customer_documents record not found.".to_string()));
    }
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&document)?, FRONT_DESK_ROLES).await?;

    let deleted = delete_row(pool, "customer_documents", &path.document_id, "id").await?;
    remove_blob(&state, &value_str(&deleted, "storage_key")).await;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "delete", "customer_documents", &path.document_id).before(deleted.clone()),
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

    use crate::{routes::v1_router, state::AppState};

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_touching_the_database() {
        let app = v1_router().with_state(AppState::for_tests());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/customers")
                    .header("content-type", "application/json")
                    .header("x-user-id", "3f0e8f8e-2c4e-4b8e-9d7a-111111111111")
                    .body(Body::from(
                        r#"{"organization_id":"3f0e8f8e-2c4e-4b8e-9d7a-222222222222","full_name":"Ana","email":"nope"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn data_routes_need_a_database() {
        let app = v1_router().with_state(AppState::for_tests());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/customers/3f0e8f8e-2c4e-4b8e-9d7a-333333333333")
                    .header("x-user-id", "3f0e8f8e-2c4e-4b8e-9d7a-111111111111")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
