use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    auth::require_user_id,
    db::{acquire, begin, commit},
    error::{AppError, AppResult},
    models::{from_row, Booking, BookingStatus},
    repository::table_service::{create_row, delete_row, get_row, lock_row},
    schemas::{
        remove_nulls, serialize_to_map, validate_input, value_str, BookingPath, CreatePaymentInput,
        PaymentPath,
    },
    services::{
        audit::{write_audit_log_tx, AuditEntry},
        booking_data::{load_booking, load_payments},
        reconciliation::summarize_payments,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, FINANCE_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/bookings/{booking_id}/payments",
            axum::routing::get(list_payments).post(create_payment),
        )
        .route(
            "/bookings/{booking_id}/payments/{payment_id}",
            axum::routing::delete(delete_payment),
        )
}

fn ensure_accepts_payments(booking: &Booking) -> Result<(), AppError> {
    if booking.status == BookingStatus::Cancelled {
        return Err(AppError::Conflict(
            "Payments cannot be registered on a cancelled booking.".to_string(),
        ));
    }
    Ok(())
}

async fn list_payments(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let (_, booking) = load_booking(&mut conn, &path.booking_id).await?;
    assert_org_member(&state, &user_id, &booking.organization_id).await?;

    let payments = load_payments(&mut conn, &booking.id).await?;
    let summary = summarize_payments(booking.total_price, &payments);
    Ok(Json(json!({
        "data": payments,
        "total_price": summary.total_price,
        "total_paid": summary.total_paid,
        "pending": summary.pending,
        "is_fully_paid": summary.is_fully_paid,
    })))
}

async fn create_payment(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
    Json(payload): Json<CreatePaymentInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let booking_row = lock_row(&mut tx, "bookings", &path.booking_id, "id").await?;
    let booking: Booking = from_row(&booking_row, "bookings")?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FINANCE_ROLES).await?;
    ensure_accepts_payments(&booking)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("organization_id".to_string(), json!(ctx.org_id));
    record.insert("booking_id".to_string(), json!(booking.id));
    record
        .entry("paid_at".to_string())
        .or_insert_with(|| json!(Utc::now().to_rfc3339()));
    record.insert("created_by_user_id".to_string(), json!(ctx.user_id));
    let created = create_row(&mut *tx, "payments", &record).await?;
    let payment_id = value_str(&created, "id");
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "create", "payments", &payment_id).after(created.clone()),
    )
    .await?;
    let summary = summarize_payments(booking.total_price, &load_payments(&mut tx, &booking.id).await?);
    commit(tx).await?;

    tracing::info!(
        booking_id = %booking.id,
        amount = payload.amount,
        method = payload.method.as_str(),
        pending = summary.pending,
        "Payment registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({ "payment": created, "summary": summary })),
    ))
}

async fn delete_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let booking_row = lock_row(&mut tx, "bookings", &path.booking_id, "id").await?;
    let booking: Booking = from_row(&booking_row, "bookings")?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FINANCE_ROLES).await?;
    if booking.status == BookingStatus::Completed && !ctx.is_admin() {
        return Err(AppError::Forbidden(
            "Only an owner_admin can remove payments from a completed booking.".to_string(),
        ));
    }

    let payment = get_row(&mut *tx, "payments", &path.payment_id, "id").await?;
    if value_str(&payment, "booking_id") != booking.id {
        return Err(AppError::NotFound("payments record not found.".to_string()));
    }
    let deleted = delete_row(&mut *tx, "payments", &path.payment_id, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "delete", "payments", &path.payment_id).before(deleted.clone()),
    )
    .await?;
    let summary = summarize_payments(booking.total_price, &load_payments(&mut tx, &booking.id).await?);
    commit(tx).await?;
    Ok(Json(json!({ "payment": deleted, "summary": summary })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use super::{ensure_accepts_payments, router};
    use crate::{models::Booking, state::AppState};

    #[test]
    fn cancelled_bookings_refuse_payments() {
        let mut booking: Booking = serde_json::from_value(json!({
            "id": "b1",
            "organization_id": "o1",
            "customer_id": "c1",
            "pickup_at": "2026-07-01T10:00:00Z",
            "return_at": "2026-07-02T10:00:00Z",
            "status": "cancelled",
        }))
        .expect("booking");
        assert!(ensure_accepts_payments(&booking).is_err());
        booking.status = crate::models::BookingStatus::Confirmed;
        assert!(ensure_accepts_payments(&booking).is_ok());
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::post("/bookings/b1/payments")
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"amount":0,"method":"cash"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
