use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    auth::require_user_id,
    db::{acquire, begin, commit, db_pool},
    error::{AppError, AppResult},
    models::{from_row, Booking, BookingStatus, Discount, ExtraKind},
    repository::table_service::{create_row, delete_where, get_row, list_rows, lock_row, update_row},
    schemas::{
        check_window, clamp_limit, discount_from, validate_input, value_str, BookingPath,
        BookingStatusInput, BookingsQuery, CompleteBookingInput, CreateBookingInput,
        UpdateBookingInput,
    },
    services::{
        audit::{write_audit_log_tx, AuditEntry},
        availability::{ensure_vehicles_free, load_booked_windows},
        booking_data::{load_booking, load_booking_vehicles, load_deposits, load_payments},
        completion::{
            complete_booking, completion_gate, deposit_return_gate, load_completion_facts,
            CompletionRequest,
        },
        pricing::{compose_total, rental_days, reprice_lines},
        quote::{
            build_quote, load_pricing_groups, load_rentable_vehicles, price_vehicles,
            resolve_lines, QuoteRequest, QuotedVehicle,
        },
        reconciliation::{summarize_deposits, summarize_payments},
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, OrgContext, FRONT_DESK_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/bookings",
            axum::routing::get(list_bookings).post(create_booking),
        )
        .route(
            "/bookings/{booking_id}",
            axum::routing::get(get_booking).patch(update_booking),
        )
        .route(
            "/bookings/{booking_id}/status",
            axum::routing::post(change_status),
        )
        .route(
            "/bookings/{booking_id}/summary",
            axum::routing::get(booking_summary),
        )
        .route(
            "/bookings/{booking_id}/completion-check",
            axum::routing::get(completion_check),
        )
        .route(
            "/bookings/{booking_id}/complete",
            axum::routing::post(complete),
        )
}

/// New bookings start as `pending` or `confirmed`; later states have their own endpoints.
fn initial_status(requested: Option<BookingStatus>) -> Result<BookingStatus, AppError> {
    match requested.unwrap_or(BookingStatus::Pending) {
        status @ (BookingStatus::Pending | BookingStatus::Confirmed) => Ok(status),
        other => Err(AppError::UnprocessableEntity(format!(
            "A booking cannot be created as '{}'.",
            other.as_str()
        ))),
    }
}

fn same_vehicle_set(current: &[String], requested: &[String]) -> bool {
    let mut current = current.to_vec();
    let mut requested = requested.to_vec();
    current.sort_unstable();
    current.dedup();
    requested.sort_unstable();
    requested.dedup();
    current == requested
}

/// Discount after a patch: fields the patch leaves out keep the stored value.
fn merged_discount(payload: &UpdateBookingInput, booking: &Booking) -> Option<Discount> {
    discount_from(
        payload.discount_type.or(booking.discount_type),
        payload.discount_value.or(booking.discount_value),
    )
}

async fn ensure_customer_in_org(conn: &mut PgConnection, customer_id: &str, org_id: &str) -> Result<(), AppError> {
    let customer = get_row(&mut *conn, "customers", customer_id, "id").await?;
    if row_org_id(&customer)? != org_id {
        return Err(AppError::NotFound("customers record not found.".to_string()));
    }
    Ok(())
}

/// Locks the vehicles, then rejects the window when any of them is already held.
pub(crate) async fn reserve_vehicles(
    conn: &mut PgConnection,
    org_id: &str,
    vehicle_ids: &[String],
    pickup_at: chrono::DateTime<Utc>,
    return_at: chrono::DateTime<Utc>,
    exclude_booking_id: Option<&str>,
) -> Result<(), AppError> {
    let mut ordered = vehicle_ids.to_vec();
    ordered.sort_unstable();
    ordered.dedup();
    for vehicle_id in &ordered {
        lock_row(&mut *conn, "vehicles", vehicle_id, "id").await?;
    }
    let windows = load_booked_windows(&mut *conn, org_id, Some(ordered.as_slice()), pickup_at, return_at).await?;
    ensure_vehicles_free(&ordered, &windows, pickup_at, return_at, exclude_booking_id)
}

pub(crate) async fn insert_booking_vehicles(
    conn: &mut PgConnection,
    org_id: &str,
    booking_id: &str,
    vehicles: &[QuotedVehicle],
) -> Result<Vec<Value>, AppError> {
    let mut rows = Vec::with_capacity(vehicles.len());
    for vehicle in vehicles {
        let mut record = Map::new();
        record.insert("organization_id".to_string(), json!(org_id));
        record.insert("booking_id".to_string(), json!(booking_id));
        record.insert("vehicle_id".to_string(), json!(vehicle.vehicle_id));
        record.insert("price".to_string(), json!(vehicle.price));
        rows.push(create_row(&mut *conn, "booking_vehicles", &record).await?);
    }
    Ok(rows)
}

/// Booking row plus its vehicles and payment position.
async fn booking_detail(conn: &mut PgConnection, row: Value) -> Result<Value, AppError> {
    let booking: Booking = from_row(&row, "bookings")?;
    let vehicles = load_booking_vehicles(conn, &booking.id).await?;
    let payments = load_payments(conn, &booking.id).await?;

    let mut detail = row;
    if let Some(obj) = detail.as_object_mut() {
        obj.insert(
            "vehicles".to_string(),
            Value::Array(
                vehicles
                    .iter()
                    .map(|(vehicle, price)| json!({ "vehicle": vehicle, "price": price }))
                    .collect(),
            ),
        );
        obj.insert(
            "payment_summary".to_string(),
            json!(summarize_payments(booking.total_price, &payments)),
        );
    }
    Ok(detail)
}

async fn list_bookings(
    State(state): State<AppState>,
    Query(query): Query<BookingsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(ctx.org_id));
    if let Some(status) = query.status {
        filters.insert("status".to_string(), json!(status.as_str()));
    }
    if let Some(customer_id) = query.customer_id.as_deref() {
        filters.insert("customer_id".to_string(), json!(customer_id));
    }
    if let Some(from) = query.from {
        filters.insert("return_at__gt".to_string(), json!(from.to_rfc3339()));
    }
    if let Some(to) = query.to {
        filters.insert("pickup_at__lt".to_string(), json!(to.to_rfc3339()));
    }
    if let Some(vehicle_id) = query.vehicle_id.as_deref() {
        let mut link_filters = Map::new();
        link_filters.insert("organization_id".to_string(), json!(ctx.org_id));
        link_filters.insert("vehicle_id".to_string(), json!(vehicle_id));
        let links = list_rows(pool, "booking_vehicles", Some(&link_filters), 5000, 0, "created_at", false).await?;
        let booking_ids = links
            .iter()
            .map(|link| value_str(link, "booking_id"))
            .collect::<Vec<_>>();
        if booking_ids.is_empty() {
            return Ok(Json(json!({ "data": [] })));
        }
        filters.insert("id".to_string(), json!(booking_ids));
    }

    let rows = list_rows(pool, "bookings", Some(&filters), clamp_limit(query.limit), 0, "pickup_at", false).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBookingInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    check_window(payload.pickup_at, payload.return_at)?;
    let status = initial_status(payload.status)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = assert_org_role(&state, &user_id, &payload.organization_id, FRONT_DESK_ROLES).await?;

    let mut tx = begin(&state).await?;
    ensure_customer_in_org(&mut tx, &payload.customer_id, &ctx.org_id).await?;
    reserve_vehicles(&mut tx, &ctx.org_id, &payload.vehicle_ids, payload.pickup_at, payload.return_at, None).await?;

    let quote = build_quote(
        &mut tx,
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
    let total_price = payload
        .total_price_override
        .unwrap_or(quote.breakdown.final_total);

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(ctx.org_id));
    record.insert("customer_id".to_string(), json!(payload.customer_id));
    record.insert("pickup_at".to_string(), json!(payload.pickup_at));
    record.insert("return_at".to_string(), json!(payload.return_at));
    record.insert("status".to_string(), json!(status.as_str()));
    record.insert("rental_days".to_string(), json!(quote.breakdown.rental_days));
    record.insert("total_price".to_string(), json!(total_price));
    record.insert("price_overridden".to_string(), json!(payload.total_price_override.is_some()));
    record.insert("include_insurance".to_string(), json!(payload.include_insurance));
    record.insert("extras".to_string(), json!(quote.extras));
    record.insert("upgrades".to_string(), json!(quote.upgrades));
    record.insert("additional_drivers".to_string(), json!(payload.additional_drivers));
    if let Some(discount) = payload.discount() {
        record.insert("discount_type".to_string(), json!(discount.kind));
        record.insert("discount_value".to_string(), json!(discount.value));
    }
    for (key, value) in [
        ("pickup_location", payload.pickup_location.as_ref()),
        ("return_location", payload.return_location.as_ref()),
        ("notes", payload.notes.as_ref()),
    ] {
        if let Some(value) = value {
            record.insert(key.to_string(), json!(value));
        }
    }
    record.insert("created_by_user_id".to_string(), json!(ctx.user_id));

    let created = create_row(&mut *tx, "bookings", &record).await?;
    let booking_id = value_str(&created, "id");
    let vehicle_rows = insert_booking_vehicles(&mut tx, &ctx.org_id, &booking_id, &quote.vehicles).await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "create", "bookings", &booking_id).after(json!({
            "booking": created,
            "vehicles": vehicle_rows,
        })),
    )
    .await?;
    commit(tx).await?;

    tracing::info!(booking_id = %booking_id, total_price, "Booking created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "booking": created,
            "vehicles": vehicle_rows,
            "price": quote.breakdown,
        })),
    ))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let row = get_row(&mut *conn, "bookings", &path.booking_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    Ok(Json(booking_detail(&mut conn, row).await?))
}

async fn update_booking(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateBookingInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let before = lock_row(&mut tx, "bookings", &path.booking_id, "id").await?;
    let booking: Booking = from_row(&before, "bookings")?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FRONT_DESK_ROLES).await?;

    let corrective = booking.status == BookingStatus::Completed;
    if corrective && !ctx.is_admin() {
        return Err(AppError::Forbidden(
            "Only an owner_admin can correct a completed booking.".to_string(),
        ));
    }
    if booking.status == BookingStatus::Cancelled {
        return Err(AppError::Conflict("Cancelled bookings cannot be edited.".to_string()));
    }

    let mut patch = Map::new();
    if let Some(customer_id) = payload.customer_id.as_deref() {
        ensure_customer_in_org(&mut tx, customer_id, &ctx.org_id).await?;
        patch.insert("customer_id".to_string(), json!(customer_id));
    }
    if payload.touches_price() {
        reprice_patch(&state, &ctx, &mut tx, &booking, &payload, &mut patch).await?;
    }
    if let Some(drivers) = payload.additional_drivers.as_ref() {
        patch.insert("additional_drivers".to_string(), json!(drivers));
    }
    for (key, value) in [
        ("pickup_location", payload.pickup_location.as_ref()),
        ("return_location", payload.return_location.as_ref()),
        ("notes", payload.notes.as_ref()),
    ] {
        if let Some(value) = value {
            patch.insert(key.to_string(), json!(value));
        }
    }
    if patch.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let updated = update_row(&mut *tx, "bookings", &path.booking_id, &patch, "id").await?;
    let action = if corrective { "corrective_edit" } else { "update" };
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, action, "bookings", &path.booking_id)
            .before(before)
            .after(updated.clone()),
    )
    .await?;
    let detail = booking_detail(&mut tx, updated).await?;
    commit(tx).await?;
    Ok(Json(detail))
}

/// Window, vehicles and lines after a price-relevant edit. Vehicle prices are
/// only looked up again when the window, the vehicles or insurance change.
async fn reprice_patch(
    state: &AppState,
    ctx: &OrgContext,
    conn: &mut PgConnection,
    booking: &Booking,
    payload: &UpdateBookingInput,
    patch: &mut Map<String, Value>,
) -> Result<(), AppError> {
    let pickup_at = payload.pickup_at.unwrap_or(booking.pickup_at);
    let return_at = payload.return_at.unwrap_or(booking.return_at);
    check_window(pickup_at, return_at)?;
    let days = rental_days(pickup_at, return_at, state.config.pickup_grace_minutes)?;
    let include_insurance = payload.include_insurance.unwrap_or(booking.include_insurance);

    let current = load_booking_vehicles(conn, &booking.id).await?;
    let current_ids = current.iter().map(|(vehicle, _)| vehicle.id.clone()).collect::<Vec<_>>();
    let vehicle_ids = payload.vehicle_ids.clone().unwrap_or_else(|| current_ids.clone());
    let window_changed = pickup_at != booking.pickup_at || return_at != booking.return_at;
    let vehicles_changed = !same_vehicle_set(&current_ids, &vehicle_ids);

    if window_changed || vehicles_changed {
        reserve_vehicles(conn, &ctx.org_id, &vehicle_ids, pickup_at, return_at, Some(&booking.id)).await?;
    }

    let vehicles = if window_changed || vehicles_changed || include_insurance != booking.include_insurance {
        let rentable = load_rentable_vehicles(conn, &ctx.org_id, &vehicle_ids, &current_ids).await?;
        let groups = load_pricing_groups(conn, &ctx.org_id).await?;
        let priced = price_vehicles(&groups, &rentable, days, include_insurance)?;

        let mut filters = Map::new();
        filters.insert("booking_id".to_string(), json!(booking.id));
        delete_where(&mut *conn, "booking_vehicles", &filters).await?;
        insert_booking_vehicles(conn, &ctx.org_id, &booking.id, &priced).await?;
        priced
    } else {
        current
            .iter()
            .map(|(vehicle, price)| QuotedVehicle {
                vehicle_id: vehicle.id.clone(),
                registration: vehicle.registration.clone(),
                vehicle_group: vehicle.vehicle_group.clone(),
                price: *price,
            })
            .collect()
    };

    let extras = match payload.extras.as_deref() {
        Some(selections) => resolve_lines(conn, &ctx.org_id, selections, ExtraKind::Extra, days).await?,
        None => reprice_lines(&booking.extras, days),
    };
    let upgrades = match payload.upgrades.as_deref() {
        Some(selections) => resolve_lines(conn, &ctx.org_id, selections, ExtraKind::Upgrade, days).await?,
        None => reprice_lines(&booking.upgrades, days),
    };
    let discount = merged_discount(payload, booking);
    let prices = vehicles.iter().map(|vehicle| vehicle.price).collect::<Vec<_>>();
    let breakdown = compose_total(days, &prices, &extras, &upgrades, discount);
    let total_price = payload.total_price_override.unwrap_or(breakdown.final_total);

    patch.insert("pickup_at".to_string(), json!(pickup_at));
    patch.insert("return_at".to_string(), json!(return_at));
    patch.insert("rental_days".to_string(), json!(days));
    patch.insert("include_insurance".to_string(), json!(include_insurance));
    patch.insert("extras".to_string(), json!(extras));
    patch.insert("upgrades".to_string(), json!(upgrades));
    patch.insert(
        "discount_type".to_string(),
        discount.map_or(Value::Null, |discount| json!(discount.kind)),
    );
    patch.insert(
        "discount_value".to_string(),
        discount.map_or(Value::Null, |discount| json!(discount.value)),
    );
    patch.insert("total_price".to_string(), json!(total_price));
    patch.insert("price_overridden".to_string(), json!(payload.total_price_override.is_some()));
    tracing::info!(
        booking_id = %booking.id,
        previous_total = booking.total_price,
        total_price,
        rental_days = days,
        "Booking repriced"
    );
    Ok(())
}

async fn change_status(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
    Json(payload): Json<BookingStatusInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    if payload.status == BookingStatus::Completed {
        return Err(AppError::Conflict(
            "Use the complete endpoint to finish a booking.".to_string(),
        ));
    }
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let before = lock_row(&mut tx, "bookings", &path.booking_id, "id").await?;
    let booking: Booking = from_row(&before, "bookings")?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FRONT_DESK_ROLES).await?;
    if !booking.status.can_transition_to(payload.status) {
        return Err(AppError::Conflict(format!(
            "Cannot move a booking from '{}' to '{}'.",
            booking.status.as_str(),
            payload.status.as_str()
        )));
    }

    let mut patch = Map::new();
    patch.insert("status".to_string(), json!(payload.status.as_str()));
    match payload.status {
        BookingStatus::Cancelled => {
            patch.insert("cancelled_at".to_string(), json!(Utc::now().to_rfc3339()));
            patch.insert("cancellation_reason".to_string(), json!(payload.reason));
        }
        BookingStatus::InProgress => {
            patch.insert("started_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        _ => {}
    }
    let updated = update_row(&mut *tx, "bookings", &path.booking_id, &patch, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "status_change", "bookings", &path.booking_id)
            .before(before)
            .after(updated.clone()),
    )
    .await?;
    commit(tx).await?;

    tracing::info!(
        booking_id = %path.booking_id,
        from = booking.status.as_str(),
        to = payload.status.as_str(),
        "Booking status changed"
    );
    Ok(Json(updated))
}

async fn booking_summary(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let (row, booking) = load_booking(&mut conn, &path.booking_id).await?;
    assert_org_member(&state, &user_id, &booking.organization_id).await?;

    let payments = load_payments(&mut conn, &booking.id).await?;
    let deposits = load_deposits(&mut conn, &booking.id).await?;
    let facts = load_completion_facts(&mut conn, &booking).await?;
    Ok(Json(json!({
        "booking": row,
        "payments": summarize_payments(booking.total_price, &payments),
        "deposits": summarize_deposits(&deposits),
        "completion": completion_gate(&facts),
        "deposit_return": deposit_return_gate(&facts),
    })))
}

async fn completion_check(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let (_, booking) = load_booking(&mut conn, &path.booking_id).await?;
    assert_org_member(&state, &user_id, &booking.organization_id).await?;

    let report = completion_gate(&load_completion_facts(&mut conn, &booking).await?);
    Ok(Json(json!({
        "booking_id": booking.id,
        "status": booking.status,
        "can_complete": report.passed,
        "missing_items": report.missing_items(),
        "report": report,
    })))
}

async fn complete(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
    Json(payload): Json<CompleteBookingInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let row = get_row(pool, "bookings", &path.booking_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&row)?, FRONT_DESK_ROLES).await?;

    let outcome = complete_booking(
        &state,
        &ctx,
        &path.booking_id,
        &CompletionRequest {
            override_gate: payload.override_gate,
            override_reason: payload.override_reason,
            send_review_request: payload.send_review_request,
        },
    )
    .await?;
    Ok(Json(json!(outcome)))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use super::{initial_status, merged_discount, router, same_vehicle_set};
    use crate::{
        models::{Booking, BookingStatus, DiscountType},
        schemas::UpdateBookingInput,
        state::AppState,
    };

    fn booking() -> Booking {
        serde_json::from_value(json!({
            "id": "b1",
            "organization_id": "o1",
            "customer_id": "c1",
            "pickup_at": "2026-07-01T10:00:00Z",
            "return_at": "2026-07-02T10:00:00Z",
            "status": "confirmed",
            "total_price": 100.0,
            "discount_type": "percentage",
            "discount_value": 10.0,
        }))
        .expect("booking")
    }

    #[test]
    fn bookings_start_pending_or_confirmed() {
        assert_eq!(initial_status(None).expect("default"), BookingStatus::Pending);
        assert_eq!(
            initial_status(Some(BookingStatus::Confirmed)).expect("confirmed"),
            BookingStatus::Confirmed
        );
        assert!(initial_status(Some(BookingStatus::InProgress)).is_err());
        assert!(initial_status(Some(BookingStatus::Completed)).is_err());
    }

    #[test]
    fn vehicle_sets_ignore_order_and_duplicates() {
        let current = vec!["v1".to_string(), "v2".to_string()];
        assert!(same_vehicle_set(&current, &["v2".to_string(), "v1".to_string(), "v1".to_string()]));
        assert!(!same_vehicle_set(&current, &["v1".to_string()]));
    }

    #[test]
    fn patch_keeps_stored_discount_fields() {
        let stored = booking();
        let untouched = merged_discount(&UpdateBookingInput::default(), &stored).expect("discount");
        assert_eq!(untouched.kind, DiscountType::Percentage);

        let flat = UpdateBookingInput {
            discount_type: Some(DiscountType::Flat),
            ..UpdateBookingInput::default()
        };
        let merged = merged_discount(&flat, &stored).expect("discount");
        assert_eq!(merged.kind, DiscountType::Flat);
        assert_eq!(merged.value, 10.0);

        let cleared = UpdateBookingInput {
            discount_value: Some(0.0),
            ..UpdateBookingInput::default()
        };
        assert!(merged_discount(&cleared, &stored).is_none());
    }

    #[tokio::test]
    async fn completion_is_not_a_manual_status() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::post("/bookings/b1/status")
                    .header("x-user-id", "00000000-0000-0000-0000-000000000001")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status":"completed"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
