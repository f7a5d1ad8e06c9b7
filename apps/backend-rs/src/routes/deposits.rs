use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    db::{acquire, begin, commit},
    error::{AppError, AppResult},
    models::{from_row, Booking, BookingStatus, Deposit, DepositStatus, PaymentMethod},
    repository::table_service::{count_rows, create_row, delete_row, lock_row, update_row},
    schemas::{
        remove_nulls, serialize_to_map, validate_input, value_str, BookingPath, CreateDepositInput,
        DepositPath, UpdateDepositInput,
    },
    services::{
        audit::{write_audit_log_tx, AuditEntry},
        booking_data::{load_booking, load_deposits},
        completion::{deposit_return_gate, load_completion_facts},
        reconciliation::{
            summarize_deposits, validate_settlement, WithheldBreakdown, MAX_DEPOSITS_PER_BOOKING,
        },
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, FINANCE_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/bookings/{booking_id}/deposits",
            axum::routing::get(list_deposits).post(create_deposit),
        )
        .route(
            "/bookings/{booking_id}/deposits/{deposit_id}",
            axum::routing::patch(update_deposit).delete(delete_deposit),
        )
        .route(
            "/bookings/{booking_id}/deposit-return-check",
            axum::routing::get(deposit_return_check),
        )
}

#[derive(Debug, Clone, PartialEq)]
struct Settlement {
    status: DepositStatus,
    returned_amount: f64,
    withheld_amount: f64,
    breakdown: WithheldBreakdown,
    return_method: PaymentMethod,
}

/// Reads the operator's settlement from a patch that returns the deposit.
/// `None` when the patch does not settle anything.
fn settlement_from(payload: &UpdateDepositInput, deposit: &Deposit) -> Result<Option<Settlement>, AppError> {
    let status = match payload.status {
        None | Some(DepositStatus::Held) => return Ok(None),
        Some(status) => status,
    };
    let returned_amount = payload.returned_amount.ok_or_else(|| {
        AppError::UnprocessableEntity("returned_amount is required to return a deposit.".to_string())
    })?;
    let return_method = payload.return_method.ok_or_else(|| {
        AppError::UnprocessableEntity("return_method is required to return a deposit.".to_string())
    })?;
    let withheld_amount = match (status, payload.withheld_amount) {
        (_, Some(amount)) => amount,
        (DepositStatus::Returned, None) => 0.0,
        (_, None) => {
            return Err(AppError::UnprocessableEntity(
                "withheld_amount is required for a partial return.".to_string(),
            ))
        }
    };
    let breakdown = WithheldBreakdown {
        damages: payload.withheld_damages.unwrap_or(0.0),
        fines: payload.withheld_fines.unwrap_or(0.0),
        extension: payload.withheld_extension.unwrap_or(0.0),
        other: payload.withheld_other.unwrap_or(0.0),
    };
    let withheld_amount = validate_settlement(deposit.amount, status, returned_amount, withheld_amount, &breakdown)?;
    Ok(Some(Settlement {
        status,
        returned_amount,
        withheld_amount,
        breakdown,
        return_method,
    }))
}

async fn list_deposits(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let (_, booking) = load_booking(&mut conn, &path.booking_id).await?;
    assert_org_member(&state, &user_id, &booking.organization_id).await?;

    let deposits = load_deposits(&mut conn, &booking.id).await?;
    let summary = summarize_deposits(&deposits);
    Ok(Json(json!({ "data": deposits, "summary": summary })))
}

async fn create_deposit(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateDepositInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let booking_row = lock_row(&mut tx, "bookings", &path.booking_id, "id").await?;
    let booking: Booking = from_row(&booking_row, "bookings")?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FINANCE_ROLES).await?;
    if booking.status == BookingStatus::Cancelled {
        return Err(AppError::Conflict(
            "Deposits cannot be registered on a cancelled booking.".to_string(),
        ));
    }

    let mut filters = Map::new();
    filters.insert("booking_id".to_string(), json!(booking.id));
    if count_rows(&mut *tx, "deposits", Some(&filters)).await? >= MAX_DEPOSITS_PER_BOOKING {
        return Err(AppError::Conflict(format!(
            "A booking can hold at most {MAX_DEPOSITS_PER_BOOKING} deposits."
        )));
    }

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("organization_id".to_string(), json!(ctx.org_id));
    record.insert("booking_id".to_string(), json!(booking.id));
    record.insert("status".to_string(), json!(DepositStatus::Held.as_str()));
    record.insert("received_at".to_string(), json!(Utc::now().to_rfc3339()));
    let created = create_row(&mut *tx, "deposits", &record).await?;
    let deposit_id = value_str(&created, "id");
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "create", "deposits", &deposit_id).after(created.clone()),
    )
    .await?;
    commit(tx).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_deposit(
    State(state): State<AppState>,
    Path(path): Path<DepositPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateDepositInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let booking_row = lock_row(&mut tx, "bookings", &path.booking_id, "id").await?;
    let booking: Booking = from_row(&booking_row, "bookings")?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FINANCE_ROLES).await?;

    let before = lock_row(&mut tx, "deposits", &path.deposit_id, "id").await?;
    let deposit: Deposit = from_row(&before, "deposits")?;
    if deposit.booking_id != booking.id {
        return Err(AppError::NotFound("deposits record not found.".to_string()));
    }

    let mut patch = Map::new();
    if let Some(notes) = payload.notes.as_deref() {
        patch.insert("notes".to_string(), json!(notes));
    }
    if payload.status == Some(DepositStatus::Held) && deposit.status != DepositStatus::Held {
        return Err(AppError::Conflict("A returned deposit cannot be reopened.".to_string()));
    }

    let mut gate = None;
    if let Some(settlement) = settlement_from(&payload, &deposit)? {
        if deposit.status != DepositStatus::Held {
            return Err(AppError::Conflict("Deposit was already returned.".to_string()));
        }
        let facts = load_completion_facts(&mut tx, &booking).await?;
        let report = deposit_return_gate(&facts);
        if !report.passed {
            if !payload.override_gate {
                return Err(AppError::Blocked {
                    message: "Deposit cannot be returned yet.".to_string(),
                    details: json!(report),
                });
            }
            if payload
                .override_reason
                .as_deref()
                .map_or(true, |reason| reason.trim().is_empty())
            {
                return Err(AppError::BadRequest(
                    "override_reason is required when overriding the return checks.".to_string(),
                ));
            }
        }

        patch.insert("status".to_string(), json!(settlement.status.as_str()));
        patch.insert("returned_amount".to_string(), json!(settlement.returned_amount));
        patch.insert("withheld_amount".to_string(), json!(settlement.withheld_amount));
        patch.insert("withheld_damages".to_string(), json!(settlement.breakdown.damages));
        patch.insert("withheld_fines".to_string(), json!(settlement.breakdown.fines));
        patch.insert("withheld_extension".to_string(), json!(settlement.breakdown.extension));
        patch.insert("withheld_other".to_string(), json!(settlement.breakdown.other));
        patch.insert("return_method".to_string(), json!(settlement.return_method.as_str()));
        patch.insert("returned_at".to_string(), json!(Utc::now().to_rfc3339()));
        patch.insert("returned_by_user_id".to_string(), json!(ctx.user_id));
        patch.insert("return_override".to_string(), json!(!report.passed));
        if !report.passed {
            patch.insert("return_override_reason".to_string(), json!(payload.override_reason));
            patch.insert("return_gate_missing".to_string(), json!(report.missing_items()));
        }
        gate = Some(report);
    }
    if patch.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let updated = update_row(&mut *tx, "deposits", &path.deposit_id, &patch, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "update", "deposits", &path.deposit_id)
            .before(before)
            .after(updated.clone()),
    )
    .await?;
    commit(tx).await?;

    if let Some(report) = gate.as_ref() {
        tracing::info!(
            booking_id = %booking.id,
            deposit_id = %path.deposit_id,
            overridden = !report.passed,
            "Deposit settled"
        );
    }
    Ok(Json(json!({ "deposit": updated, "report": gate })))
}

async fn delete_deposit(
    State(state): State<AppState>,
    Path(path): Path<DepositPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let booking_row = lock_row(&mut tx, "bookings", &path.booking_id, "id").await?;
    let booking: Booking = from_row(&booking_row, "bookings")?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FINANCE_ROLES).await?;

    let record = lock_row(&mut tx, "deposits", &path.deposit_id, "id").await?;
    let deposit: Deposit = from_row(&record, "deposits")?;
    if deposit.booking_id != booking.id {
        return Err(AppError::NotFound("deposits record not found.".to_string()));
    }
    if deposit.status != DepositStatus::Held {
        return Err(AppError::Conflict(
            "Only deposits still held can be deleted.".to_string(),
        ));
    }
    let deleted = delete_row(&mut *tx, "deposits", &path.deposit_id, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "delete", "deposits", &path.deposit_id).before(deleted.clone()),
    )
    .await?;
    commit(tx).await?;
    Ok(Json(deleted))
}

async fn deposit_return_check(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let (_, booking) = load_booking(&mut conn, &path.booking_id).await?;
    assert_org_member(&state, &user_id, &booking.organization_id).await?;

    let report = deposit_return_gate(&load_completion_facts(&mut conn, &booking).await?);
    Ok(Json(json!({
        "booking_id": booking.id,
        "can_return": report.passed,
        "missing_items": report.missing_items(),
        "report": report,
    })))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::settlement_from;
    use crate::{
        models::{Deposit, DepositStatus, PaymentMethod},
        schemas::UpdateDepositInput,
    };

    fn deposit() -> Deposit {
        serde_json::from_value(json!({
            "id": "d1",
            "booking_id": "b1",
            "amount": 300.0,
            "payment_method": "card_terminal",
            "status": "held",
        }))
        .expect("deposit")
    }

    #[test]
    fn notes_only_patch_settles_nothing() {
        let payload = UpdateDepositInput {
            notes: Some("keys in drawer".to_string()),
            ..UpdateDepositInput::default()
        };
        assert!(settlement_from(&payload, &deposit()).expect("patch").is_none());
    }

    #[test]
    fn full_return_defaults_withheld_to_zero() {
        let payload = UpdateDepositInput {
            status: Some(DepositStatus::Returned),
            returned_amount: Some(300.0),
            return_method: Some(PaymentMethod::Cash),
            ..UpdateDepositInput::default()
        };
        let settlement = settlement_from(&payload, &deposit()).expect("valid").expect("settled");
        assert_eq!(settlement.withheld_amount, 0.0);
        assert_eq!(settlement.return_method, PaymentMethod::Cash);
    }

    #[test]
    fn partial_return_needs_matching_breakdown() {
        let mut payload = UpdateDepositInput {
            status: Some(DepositStatus::PartiallyReturned),
            returned_amount: Some(250.0),
            return_method: Some(PaymentMethod::Cash),
            ..UpdateDepositInput::default()
        };
        assert!(settlement_from(&payload, &deposit()).is_err());

        payload.withheld_amount = Some(50.0);
        payload.withheld_damages = Some(30.0);
        assert!(settlement_from(&payload, &deposit()).is_err());

        payload.withheld_fines = Some(20.0);
        let settlement = settlement_from(&payload, &deposit()).expect("valid").expect("settled");
        assert_eq!(settlement.withheld_amount, 50.0);
    }

    #[test]
    fn settlement_requires_method_and_amount() {
        let payload = UpdateDepositInput {
            status: Some(DepositStatus::Returned),
            returned_amount: Some(300.0),
            ..UpdateDepositInput::default()
        };
        assert!(settlement_from(&payload, &deposit()).is_err());
    }
}
