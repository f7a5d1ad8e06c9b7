//! Public booking widget: unauthenticated endpoints keyed by organization slug.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    db::{acquire, begin, commit, db_pool},
    error::{AppError, AppResult},
    models::{from_row, from_rows, BookingStatus, ExtraKind, Organization, PricingGroup, RentalExtra, Vehicle, VehicleStatus},
    repository::table_service::{create_row, list_rows},
    routes::bookings::{insert_booking_vehicles, reserve_vehicles},
    schemas::{
        check_window, validate_input, value_str, PublicAvailabilityQuery, PublicOrgPath,
        PublicQuoteInput, PublicReserveInput,
    },
    services::{
        audit::{write_audit_log_tx, AuditEntry},
        availability::{free_vehicle_ids, load_booked_windows},
        pricing::{compose_total, group_price, rental_days, vehicle_price, PriceBreakdown},
        quote::{load_pricing_groups, resolve_lines, QuotedVehicle},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/public/booking/{org_slug}",
            axum::routing::get(get_booking_page),
        )
        .route(
            "/public/booking/{org_slug}/availability",
            axum::routing::get(check_availability),
        )
        .route(
            "/public/booking/{org_slug}/quote",
            axum::routing::post(quote_group),
        )
        .route(
            "/public/booking/{org_slug}/reserve",
            axum::routing::post(reserve),
        )
}

/// Resolves a widget-enabled organization by slug through the short-lived cache.
async fn find_widget_org(state: &AppState, slug: &str) -> AppResult<Organization> {
    let slug = slug.trim().to_ascii_lowercase();
    let row = match state.public_org_cache.get(&slug).await {
        Some(row) => row,
        None => {
            let mut filters = Map::new();
            filters.insert("org_slug".to_string(), json!(slug));
            let row = list_rows(db_pool(state)?, "organizations", Some(&filters), 1, 0, "created_at", true)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| AppError::NotFound("Organization not found.".to_string()))?;
            state.public_org_cache.insert(slug.clone(), row.clone()).await;
            row
        }
    };
    let org: Organization = from_row(&row, "organizations")?;
    if !org.booking_widget_enabled {
        return Err(AppError::NotFound(
            "Online booking is not enabled for this organization.".to_string(),
        ));
    }
    Ok(org)
}

fn org_card(org: &Organization) -> Value {
    json!({
        "id": org.id,
        "name": org.name,
        "org_slug": org.org_slug,
        "contact_email": org.contact_email,
        "contact_phone": org.contact_phone,
        "currency": org.currency,
        "timezone": org.timezone,
        "default_locale": org.default_locale,
    })
}

async fn active_vehicles(
    conn: &mut PgConnection,
    org_id: &str,
    vehicle_group: Option<&str>,
) -> Result<Vec<Vehicle>, AppError> {
    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(org_id));
    filters.insert("status".to_string(), json!(VehicleStatus::Active.as_str()));
    if let Some(group) = vehicle_group {
        filters.insert("vehicle_group".to_string(), json!(group));
    }
    let rows = list_rows(&mut *conn, "vehicles", Some(&filters), 1000, 0, "registration", true).await?;
    from_rows(&rows, "vehicles")
}

async fn active_extras(conn: &mut PgConnection, org_id: &str) -> Result<Vec<RentalExtra>, AppError> {
    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(org_id));
    filters.insert("is_active".to_string(), json!(true));
    let rows = list_rows(&mut *conn, "rental_extras", Some(&filters), 500, 0, "name", true).await?;
    from_rows(&rows, "rental_extras")
}

#[derive(Debug, Clone, Serialize)]
struct GroupCard {
    vehicle_group: String,
    vehicle_count: usize,
    starting_price: f64,
    insurance_per_day: f64,
}

/// Groups that have a price list and at least one active vehicle.
fn group_cards(groups: &[PricingGroup], vehicles: &[Vehicle]) -> Vec<GroupCard> {
    let mut counts = BTreeMap::<&str, usize>::new();
    for vehicle in vehicles {
        if let Some(group) = vehicle.vehicle_group.as_deref() {
            *counts.entry(group).or_default() += 1;
        }
    }
    groups
        .iter()
        .filter_map(|group| {
            let vehicle_count = counts.get(group.vehicle_group.as_str()).copied()?;
            Some(GroupCard {
                vehicle_group: group.vehicle_group.clone(),
                vehicle_count,
                starting_price: group_price(group, 1)?,
                insurance_per_day: group.insurance_per_day,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
struct GroupAvailability {
    vehicle_group: String,
    available_count: usize,
    rental_days: i64,
    price: f64,
    price_with_insurance: f64,
}

fn available_groups(
    groups: &[PricingGroup],
    free_vehicles: &[&Vehicle],
    days: i64,
) -> Vec<GroupAvailability> {
    groups
        .iter()
        .filter_map(|group| {
            let available_count = free_vehicles
                .iter()
                .filter(|vehicle| vehicle.vehicle_group.as_deref() == Some(group.vehicle_group.as_str()))
                .count();
            if available_count == 0 {
                return None;
            }
            Some(GroupAvailability {
                vehicle_group: group.vehicle_group.clone(),
                available_count,
                rental_days: days,
                price: vehicle_price(group, days, false)?,
                price_with_insurance: vehicle_price(group, days, true)?,
            })
        })
        .collect()
}

async fn get_booking_page(
    State(state): State<AppState>,
    Path(path): Path<PublicOrgPath>,
) -> AppResult<Json<Value>> {
    let org = find_widget_org(&state, &path.org_slug).await?;
    let mut conn = acquire(&state).await?;

    let mut groups = load_pricing_groups(&mut conn, &org.id).await?.into_values().collect::<Vec<_>>();
    groups.sort_by(|a, b| a.vehicle_group.cmp(&b.vehicle_group));
    let vehicles = active_vehicles(&mut conn, &org.id, None).await?;
    let (extras, upgrades): (Vec<_>, Vec<_>) = active_extras(&mut conn, &org.id)
        .await?
        .into_iter()
        .partition(|extra| extra.kind == ExtraKind::Extra);

    Ok(Json(json!({
        "organization": org_card(&org),
        "vehicle_groups": group_cards(&groups, &vehicles),
        "extras": extras,
        "upgrades": upgrades,
    })))
}

async fn check_availability(
    State(state): State<AppState>,
    Path(path): Path<PublicOrgPath>,
    Query(query): Query<PublicAvailabilityQuery>,
) -> AppResult<Json<Value>> {
    check_window(query.pickup_at, query.return_at)?;
    let days = rental_days(query.pickup_at, query.return_at, state.config.pickup_grace_minutes)?;
    let org = find_widget_org(&state, &path.org_slug).await?;
    let mut conn = acquire(&state).await?;

    let mut groups = load_pricing_groups(&mut conn, &org.id).await?.into_values().collect::<Vec<_>>();
    groups.sort_by(|a, b| a.vehicle_group.cmp(&b.vehicle_group));
    let vehicles = active_vehicles(&mut conn, &org.id, None).await?;
    let ids = vehicles.iter().map(|vehicle| vehicle.id.clone()).collect::<Vec<_>>();
    let windows = load_booked_windows(&mut *conn, &org.id, None, query.pickup_at, query.return_at).await?;
    let free = free_vehicle_ids(&ids, &windows, query.pickup_at, query.return_at, None);
    let free_vehicles = vehicles
        .iter()
        .filter(|vehicle| free.contains(&vehicle.id))
        .collect::<Vec<_>>();

    Ok(Json(json!({
        "pickup_at": query.pickup_at,
        "return_at": query.return_at,
        "data": available_groups(&groups, &free_vehicles, days),
    })))
}

struct GroupQuote {
    vehicle_price: f64,
    extras: Vec<crate::models::BookingLine>,
    upgrades: Vec<crate::models::BookingLine>,
    breakdown: PriceBreakdown,
}

async fn price_group(
    conn: &mut PgConnection,
    org_id: &str,
    input: &PublicQuoteInput,
    grace_minutes: i64,
) -> Result<GroupQuote, AppError> {
    let days = rental_days(input.pickup_at, input.return_at, grace_minutes)?;
    let groups = load_pricing_groups(conn, org_id).await?;
    let group = groups
        .get(input.vehicle_group.trim())
        .ok_or_else(|| AppError::NotFound(format!("Vehicle group {} not found.", input.vehicle_group)))?;
    let price = vehicle_price(group, days, input.include_insurance).ok_or_else(|| {
        AppError::UnprocessableEntity(format!(
            "Vehicle group {} has no prices configured.",
            group.vehicle_group
        ))
    })?;
    let extras = resolve_lines(conn, org_id, &input.extras, ExtraKind::Extra, days).await?;
    let upgrades = resolve_lines(conn, org_id, &input.upgrades, ExtraKind::Upgrade, days).await?;
    let breakdown = compose_total(days, &[price], &extras, &upgrades, None);
    Ok(GroupQuote {
        vehicle_price: price,
        extras,
        upgrades,
        breakdown,
    })
}

async fn quote_group(
    State(state): State<AppState>,
    Path(path): Path<PublicOrgPath>,
    Json(payload): Json<PublicQuoteInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    check_window(payload.pickup_at, payload.return_at)?;
    let org = find_widget_org(&state, &path.org_slug).await?;
    let mut conn = acquire(&state).await?;

    let quote = price_group(&mut conn, &org.id, &payload, state.config.pickup_grace_minutes).await?;
    Ok(Json(json!({
        "vehicle_group": payload.vehicle_group.trim(),
        "vehicle_price": quote.vehicle_price,
        "extras": quote.extras,
        "upgrades": quote.upgrades,
        "price": quote.breakdown,
        "currency": org.currency,
    })))
}

/// `ILIKE` pattern matching `raw` literally, case-insensitively.
fn literal_ilike(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

async fn match_or_create_customer(
    conn: &mut PgConnection,
    org_id: &str,
    payload: &PublicReserveInput,
) -> Result<(Value, bool), AppError> {
    let email = payload.email.trim().to_ascii_lowercase();
    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(org_id));
    filters.insert("email__ilike".to_string(), json!(literal_ilike(&email)));
    if let Some(existing) = list_rows(&mut *conn, "customers", Some(&filters), 1, 0, "created_at", true)
        .await?
        .into_iter()
        .next()
    {
        return Ok((existing, false));
    }

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(org_id));
    record.insert("full_name".to_string(), json!(payload.full_name.trim()));
    record.insert("email".to_string(), json!(email));
    if let Some(phone) = payload.phone_e164.as_deref() {
        record.insert("phone_e164".to_string(), json!(phone.trim()));
    }
    if let Some(language) = payload.preferred_language.as_deref() {
        record.insert("preferred_language".to_string(), json!(language.trim().to_ascii_lowercase()));
    }
    Ok((create_row(&mut *conn, "customers", &record).await?, true))
}

async fn reserve(
    State(state): State<AppState>,
    Path(path): Path<PublicOrgPath>,
    Json(payload): Json<PublicReserveInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let input = &payload.quote;
    check_window(input.pickup_at, input.return_at)?;
    let org = find_widget_org(&state, &path.org_slug).await?;

    let mut tx = begin(&state).await?;
    let quote = price_group(&mut tx, &org.id, input, state.config.pickup_grace_minutes).await?;

    let candidates = active_vehicles(&mut tx, &org.id, Some(input.vehicle_group.trim())).await?;
    let ids = candidates.iter().map(|vehicle| vehicle.id.clone()).collect::<Vec<_>>();
    let windows = load_booked_windows(&mut *tx, &org.id, Some(ids.as_slice()), input.pickup_at, input.return_at).await?;
    let mut chosen = None;
    for vehicle_id in free_vehicle_ids(&ids, &windows, input.pickup_at, input.return_at, None) {
        let single = [vehicle_id];
        match reserve_vehicles(&mut tx, &org.id, &single, input.pickup_at, input.return_at, None).await {
            Ok(()) => {
                let [vehicle_id] = single;
                chosen = Some(vehicle_id);
                break;
            }
            Err(AppError::Blocked { .. }) => continue,
            Err(error) => return Err(error),
        }
    }
    let vehicle_id = chosen.ok_or_else(|| {
        AppError::Conflict("No vehicle of this group is free for the selected dates.".to_string())
    })?;

    let (customer, customer_created) = match_or_create_customer(&mut tx, &org.id, &payload).await?;
    let customer_id = value_str(&customer, "id");

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(org.id));
    record.insert("customer_id".to_string(), json!(customer_id));
    record.insert("pickup_at".to_string(), json!(input.pickup_at));
    record.insert("return_at".to_string(), json!(input.return_at));
    record.insert("status".to_string(), json!(BookingStatus::Pending.as_str()));
    record.insert("rental_days".to_string(), json!(quote.breakdown.rental_days));
    record.insert("total_price".to_string(), json!(quote.breakdown.final_total));
    record.insert("include_insurance".to_string(), json!(input.include_insurance));
    record.insert("extras".to_string(), json!(quote.extras));
    record.insert("upgrades".to_string(), json!(quote.upgrades));
    record.insert("source".to_string(), json!("widget"));
    if let Some(notes) = payload.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        record.insert("notes".to_string(), json!(notes));
    }
    let created = create_row(&mut *tx, "bookings", &record).await?;
    let booking_id = value_str(&created, "id");
    let vehicles = [QuotedVehicle {
        vehicle_id: vehicle_id.clone(),
        registration: String::new(),
        vehicle_group: Some(input.vehicle_group.trim().to_string()),
        price: quote.vehicle_price,
    }];
    insert_booking_vehicles(&mut tx, &org.id, &booking_id, &vehicles).await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::public(&org.id, "public_reserve", "bookings", &booking_id).after(json!({
            "booking": created,
            "vehicle_id": vehicle_id,
            "customer_id": customer_id,
            "customer_created": customer_created,
        })),
    )
    .await?;
    commit(tx).await?;

    tracing::info!(org_id = %org.id, booking_id = %booking_id, customer_created, "Widget booking received");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "booking_id": booking_id,
            "status": BookingStatus::Pending.as_str(),
            "pickup_at": input.pickup_at,
            "return_at": input.return_at,
            "vehicle_group": input.vehicle_group.trim(),
            "price": quote.breakdown,
        })),
    ))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use super::{available_groups, group_cards, literal_ilike, router};
    use crate::{
        models::{PricingGroup, Vehicle},
        state::AppState,
    };

    fn group(name: &str, day_price: f64) -> PricingGroup {
        serde_json::from_value(json!({
            "id": format!("g-{name}"),
            "organization_id": "o1",
            "vehicle_group": name,
            "tiers": [{ "days": 1, "price": day_price }, { "days": 3, "price": day_price * 2.5 }],
            "extra_day_price": day_price * 0.8,
            "insurance_per_day": 5.0,
        }))
        .expect("group")
    }

    fn vehicle(id: &str, group: &str) -> Vehicle {
        serde_json::from_value(json!({
            "id": id,
            "organization_id": "o1",
            "registration": id.to_uppercase(),
            "vehicle_group": group,
            "status": "active",
        }))
        .expect("vehicle")
    }

    #[test]
    fn group_cards_skip_groups_without_vehicles() {
        let groups = [group("A", 30.0), group("B", 50.0)];
        let vehicles = [vehicle("v1", "A"), vehicle("v2", "A")];
        let cards = group_cards(&groups, &vehicles);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].vehicle_group, "A");
        assert_eq!(cards[0].vehicle_count, 2);
        assert_eq!(cards[0].starting_price, 30.0);
    }

    #[test]
    fn availability_prices_each_free_group() {
        let groups = [group("A", 30.0), group("B", 50.0)];
        let a = vehicle("v1", "A");
        let b = vehicle("v2", "B");
        let free = vec![&a, &b];
        let result = available_groups(&groups, &free, 3);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].price, 75.0);
        assert_eq!(result[0].price_with_insurance, 90.0);
        assert_eq!(result[1].available_count, 1);
    }

    #[test]
    fn email_patterns_are_literal() {
        assert_eq!(literal_ilike("a_b%c@x.io"), "a\\_b\\%c@x.io");
    }

    #[tokio::test]
    async fn reserve_requires_a_valid_email() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::post("/public/booking/motos-sol/reserve")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"vehicle_group":"A","pickup_at":"2026-07-01T10:00:00Z","return_at":"2026-07-03T10:00:00Z","full_name":"Ana","email":"not-an-email"}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
