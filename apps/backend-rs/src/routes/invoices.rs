use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    db::{begin, commit, db_pool},
    error::{AppError, AppResult},
    models::BookingStatus,
    repository::table_service::{get_row, list_rows, lock_row, update_row},
    schemas::{
        clamp_limit, validate_input, value_str, BookingPath, InvoicePath, InvoicesQuery,
        VoidInvoiceInput,
    },
    services::{
        audit::{write_audit_log_tx, AuditEntry},
        booking_data::{load_booking, load_booking_vehicles, load_payments},
        invoicing::{create_invoice_tx, issued_invoice, InvoiceDraft},
    },
    state::AppState,
    tenancy::{
        assert_org_member, assert_org_role, row_org_id, FINANCE_ROLES, ROLE_ACCOUNTANT,
        ROLE_OWNER_ADMIN,
    },
};

const VOID_ROLES: &[&str] = &[ROLE_OWNER_ADMIN, ROLE_ACCOUNTANT];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/invoices", axum::routing::get(list_invoices))
        .route("/invoices/{invoice_id}", axum::routing::get(get_invoice))
        .route(
            "/invoices/{invoice_id}/void",
            axum::routing::post(void_invoice),
        )
        .route(
            "/bookings/{booking_id}/invoice",
            axum::routing::post(generate_invoice),
        )
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoicesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    if let Some(booking_id) = query.booking_id.as_deref() {
        filters.insert("booking_id".to_string(), json!(booking_id));
    }
    if let Some(kind) = query.kind {
        filters.insert("kind".to_string(), json!(kind.as_str()));
    }
    let rows = list_rows(db_pool(&state)?, "invoices", Some(&filters), clamp_limit(query.limit), 0, "issued_at", false).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let row = get_row(db_pool(&state)?, "invoices", &path.invoice_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    Ok(Json(row))
}

async fn generate_invoice(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let (_, booking) = load_booking(&mut tx, &path.booking_id).await?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FINANCE_ROLES).await?;
    if matches!(booking.status, BookingStatus::Cancelled | BookingStatus::Pending) {
        return Err(AppError::Conflict(format!(
            "A {} booking cannot be invoiced.",
            booking.status.as_str()
        )));
    }
    lock_row(&mut tx, "bookings", &booking.id, "id").await?;
    if let Some(existing) = issued_invoice(&mut tx, &booking.id).await? {
        return Err(AppError::Conflict(format!(
            "Booking already has invoice {}.",
            value_str(&existing, "number")
        )));
    }

    let vehicles = load_booking_vehicles(&mut tx, &booking.id).await?;
    let payments = load_payments(&mut tx, &booking.id).await?;
    let created = create_invoice_tx(
        &mut tx,
        InvoiceDraft {
            booking: &booking,
            vehicles: &vehicles,
            payments: &payments,
            vat_rate_percent: state.config.vat_rate_percent,
            issued_at: Utc::now(),
        },
    )
    .await?;
    let invoice_id = value_str(&created, "id");
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "create", "invoices", &invoice_id).after(created.clone()),
    )
    .await?;
    commit(tx).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn void_invoice(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    headers: HeaderMap,
    payload: Option<Json<VoidInvoiceInput>>,
) -> AppResult<Json<Value>> {
    let payload = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let before = lock_row(&mut tx, "invoices", &path.invoice_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, VOID_ROLES).await?;
    if value_str(&before, "status") == "void" {
        return Err(AppError::Conflict("Invoice is already void.".to_string()));
    }

    let mut patch = Map::new();
    patch.insert("status".to_string(), json!("void"));
    patch.insert("voided_at".to_string(), json!(Utc::now().to_rfc3339()));
    patch.insert("voided_by_user_id".to_string(), json!(ctx.user_id));
    if let Some(reason) = payload.reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        patch.insert("void_reason".to_string(), json!(reason));
    }
    let updated = update_row(&mut *tx, "invoices", &path.invoice_id, &patch, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "void", "invoices", &path.invoice_id)
            .before(before)
            .after(updated.clone()),
    )
    .await?;
    commit(tx).await?;

    tracing::info!(invoice_id = %path.invoice_id, "Invoice voided");
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::{router, VOID_ROLES};
    use crate::state::AppState;

    #[test]
    fn operators_cannot_void() {
        assert!(!VOID_ROLES.contains(&"operator"));
        assert!(VOID_ROLES.contains(&"accountant"));
    }

    #[tokio::test]
    async fn unknown_kind_filter_is_rejected() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::get("/invoices?org_id=o1&kind=receipt")
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
