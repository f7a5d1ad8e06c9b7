use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    auth::require_user_id,
    db::{begin, commit, db_pool},
    error::{AppError, AppResult},
    models::{from_row, from_rows, MaintenanceExpense, MaintenanceStatus, Vehicle},
    repository::table_service::{
        count_rows, create_row, delete_row, delete_where, get_row, list_rows, lock_row, update_row,
    },
    schemas::{
        clamp_limit, non_empty_patch, remove_nulls, serialize_to_map, validate_input, value_str,
        CreateExpenseInput, CreateMaintenanceInput, ExpensePath, MaintenancePath,
        MaintenanceQuery, UpdateExpenseInput, UpdateMaintenanceInput,
    },
    services::{
        audit::{write_audit_log, write_audit_log_tx, AuditEntry},
        maintenance::{expense_totals, vehicle_status_after},
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, FRONT_DESK_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/maintenance-records",
            axum::routing::get(list_records).post(create_record),
        )
        .route(
            "/maintenance-records/{record_id}",
            axum::routing::get(get_record)
                .patch(update_record)
                .delete(delete_record),
        )
        .route(
            "/maintenance-records/{record_id}/expenses",
            axum::routing::get(list_expenses).post(create_expense),
        )
        .route(
            "/maintenance-records/{record_id}/expenses/{expense_id}",
            axum::routing::patch(update_expense).delete(delete_expense),
        )
}

fn attach_expenses(mut record: Value, expenses: Vec<Value>) -> Result<Value, AppError> {
    let parsed: Vec<MaintenanceExpense> = from_rows(&expenses, "maintenance_expenses")?;
    let totals = expense_totals(&parsed);
    if let Some(obj) = record.as_object_mut() {
        obj.insert("expenses".to_string(), Value::Array(expenses));
        obj.insert("expense_totals".to_string(), json!(totals));
    }
    Ok(record)
}

async fn record_expenses(conn: &mut PgConnection, record_id: &str) -> Result<Vec<Value>, AppError> {
    let mut filters = Map::new();
    filters.insert("maintenance_record_id".to_string(), json!(record_id));
    list_rows(&mut *conn, "maintenance_expenses", Some(&filters), 500, 0, "created_at", true).await
}

/// Moves the vehicle in or out of `maintenance` after a record change.
/// `record_status` is the status the record is left in.
async fn sync_vehicle_status(
    conn: &mut PgConnection,
    vehicle_id: &str,
    record_id: &str,
    record_status: MaintenanceStatus,
) -> Result<Option<Value>, AppError> {
    let vehicle_row = lock_row(&mut *conn, "vehicles", vehicle_id, "id").await?;
    let vehicle: Vehicle = from_row(&vehicle_row, "vehicles")?;

    let mut filters = Map::new();
    filters.insert("vehicle_id".to_string(), json!(vehicle_id));
    filters.insert("status".to_string(), json!(MaintenanceStatus::InProgress.as_str()));
    filters.insert("id__ne".to_string(), json!(record_id));
    let other_open = count_rows(&mut *conn, "maintenance_records", Some(&filters)).await?;

    let Some(next) = vehicle_status_after(record_status, vehicle.status, other_open) else {
        return Ok(None);
    };
    let mut patch = Map::new();
    patch.insert("status".to_string(), json!(next.as_str()));
    let updated = update_row(&mut *conn, "vehicles", vehicle_id, &patch, "id").await?;
    tracing::info!(
        vehicle_id,
        maintenance_record_id = record_id,
        status = next.as_str(),
        "Vehicle status synced with maintenance"
    );
    Ok(Some(updated))
}

async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<MaintenanceQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    if let Some(vehicle_id) = query.vehicle_id.as_deref() {
        filters.insert("vehicle_id".to_string(), json!(vehicle_id));
    }
    if let Some(status) = query.status {
        filters.insert("status".to_string(), json!(status.as_str()));
    }
    let records = list_rows(
        pool,
        "maintenance_records",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "service_date",
        false,
    )
    .await?;

    let record_ids = records
        .iter()
        .map(|record| value_str(record, "id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let mut expenses_by_record: HashMap<String, Vec<Value>> = HashMap::new();
    if !record_ids.is_empty() {
        let mut expense_filters = Map::new();
        expense_filters.insert("maintenance_record_id".to_string(), json!(record_ids));
        let expenses = list_rows(
            pool,
            "maintenance_expenses",
            Some(&expense_filters),
            5000,
            0,
            "created_at",
            true,
        )
        .await?;
        for expense in expenses {
            expenses_by_record
                .entry(value_str(&expense, "maintenance_record_id"))
                .or_default()
                .push(expense);
        }
    }

    let data = records
        .into_iter()
        .map(|record| {
            let expenses = expenses_by_record
                .remove(&value_str(&record, "id"))
                .unwrap_or_default();
            attach_expenses(record, expenses)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(json!({ "data": data })))
}

async fn create_record(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateMaintenanceInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_role(&state, &user_id, &payload.organization_id, FRONT_DESK_ROLES).await?;

    let mut tx = begin(&state).await?;
    let vehicle = get_row(&mut *tx, "vehicles", &payload.vehicle_id, "id").await?;
    if row_org_id(&vehicle)? != ctx.org_id {
        return Err(AppError::NotFound("vehicles record not found.".to_string()));
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("created_by_user_id".to_string(), json!(ctx.user_id));
    let created = create_row(&mut *tx, "maintenance_records", &record).await?;
    let record_id = value_str(&created, "id");
    let vehicle_after = sync_vehicle_status(&mut tx, &payload.vehicle_id, &record_id, payload.status).await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "create", "maintenance_records", &record_id).after(created.clone()),
    )
    .await?;
    commit(tx).await?;

    let mut response = attach_expenses(created, Vec::new())?;
    if let (Some(obj), Some(vehicle)) = (response.as_object_mut(), vehicle_after) {
        obj.insert("vehicle".to_string(), vehicle);
    }
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_record(
    State(state): State<AppState>,
    Path(path): Path<MaintenancePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "maintenance_records", &path.record_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&record)?).await?;

    let mut conn = crate::db::acquire(&state).await?;
    let expenses = record_expenses(&mut conn, &path.record_id).await?;
    Ok(Json(attach_expenses(record, expenses)?))
}

async fn update_record(
    State(state): State<AppState>,
    Path(path): Path<MaintenancePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateMaintenanceInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;

    let mut tx = begin(&state).await?;
    let before = lock_row(&mut tx, "maintenance_records", &path.record_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, FRONT_DESK_ROLES).await?;

    let updated = update_row(&mut *tx, "maintenance_records", &path.record_id, &patch, "id").await?;
    let mut vehicle_after = None;
    if let Some(status) = payload.status {
        vehicle_after = sync_vehicle_status(
            &mut tx,
            &value_str(&before, "vehicle_id"),
            &path.record_id,
            status,
        )
        .await?;
    }
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "update", "maintenance_records", &path.record_id)
            .before(before)
            .after(updated.clone()),
    )
    .await?;
    let expenses = record_expenses(&mut tx, &path.record_id).await?;
    commit(tx).await?;

    let mut response = attach_expenses(updated, expenses)?;
    if let (Some(obj), Some(vehicle)) = (response.as_object_mut(), vehicle_after) {
        obj.insert("vehicle".to_string(), vehicle);
    }
    Ok(Json(response))
}

async fn delete_record(
    State(state): State<AppState>,
    Path(path): Path<MaintenancePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let record = lock_row(&mut tx, "maintenance_records", &path.record_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&record)?, FRONT_DESK_ROLES).await?;

    let mut filters = Map::new();
    filters.insert("maintenance_record_id".to_string(), json!(path.record_id));
    delete_where(&mut *tx, "maintenance_expenses", &filters).await?;
    let deleted = delete_row(&mut *tx, "maintenance_records", &path.record_id, "id").await?;

    // A removed open record releases the vehicle like a completed one.
    if value_str(&deleted, "status") == MaintenanceStatus::InProgress.as_str() {
        sync_vehicle_status(
            &mut tx,
            &value_str(&deleted, "vehicle_id"),
            &path.record_id,
            MaintenanceStatus::Completed,
        )
        .await?;
    }
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "delete", "maintenance_records", &path.record_id).before(deleted.clone()),
    )
    .await?;
    commit(tx).await?;
    Ok(Json(deleted))
}

async fn list_expenses(
    State(state): State<AppState>,
    Path(path): Path<MaintenancePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "maintenance_records", &path.record_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&record)?).await?;

    let mut conn = crate::db::acquire(&state).await?;
    let expenses = record_expenses(&mut conn, &path.record_id).await?;
    let parsed: Vec<MaintenanceExpense> = from_rows(&expenses, "maintenance_expenses")?;
    Ok(Json(json!({ "data": expenses, "totals": expense_totals(&parsed) })))
}

async fn create_expense(
    State(state): State<AppState>,
    Path(path): Path<MaintenancePath>,
    headers: HeaderMap,
    Json(payload): Json<CreateExpenseInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "maintenance_records", &path.record_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&record)?, FRONT_DESK_ROLES).await?;

    let mut row = remove_nulls(serialize_to_map(&payload));
    row.insert("organization_id".to_string(), json!(ctx.org_id));
    row.insert("maintenance_record_id".to_string(), json!(path.record_id));
    let created = create_row(pool, "maintenance_expenses", &row).await?;
    let expense_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "create", "maintenance_expenses", &expense_id).after(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn load_expense(
    state: &AppState,
    path: &ExpensePath,
) -> Result<Value, AppError> {
    let expense = get_row(db_pool(state)?, "maintenance_expenses", &path.expense_id, "id").await?;
    if value_str(&expense, "maintenance_record_id") != path.record_id {
        return Err(AppError::NotFound("maintenance_expenses record not found.".to_string()));
    }
    Ok(expense)
}

async fn update_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateExpenseInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let before = load_expense(&state, &path).await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, FRONT_DESK_ROLES).await?;

    let patch = non_empty_patch(remove_nulls(serialize_to_map(&payload)))?;
    let updated = update_row(db_pool(&state)?, "maintenance_expenses", &path.expense_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "update", "maintenance_expenses", &path.expense_id)
            .before(before)
            .after(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let expense = load_expense(&state, &path).await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&expense)?, FRONT_DESK_ROLES).await?;

    let deleted = delete_row(db_pool(&state)?, "maintenance_expenses", &path.expense_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "delete", "maintenance_expenses", &path.expense_id).before(deleted.clone()),
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
    use serde_json::json;
    use tower::ServiceExt;

    use super::{attach_expenses, router};
    use crate::state::AppState;

    #[test]
    fn records_carry_expense_totals() {
        let record = json!({ "id": "m1", "status": "completed" });
        let expenses = vec![
            json!({ "id": "e1", "maintenance_record_id": "m1", "concept": "Oil", "amount": 40.5, "payer": "owner" }),
            json!({ "id": "e2", "maintenance_record_id": "m1", "concept": "Labour", "amount": 60, "payer": "workshop" }),
        ];
        let decorated = attach_expenses(record, expenses).expect("expenses");
        assert_eq!(decorated["expenses"].as_array().map(Vec::len), Some(2));
        assert_eq!(decorated["expense_totals"]["owner"], 40.5);
        assert_eq!(decorated["expense_totals"]["total"], 100.5);
    }

    #[tokio::test]
    async fn empty_patch_is_rejected_before_touching_the_database() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::patch("/maintenance-records/m1")
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
