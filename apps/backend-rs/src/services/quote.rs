//! Server-side price quotes: loads the catalog rows a quote needs and feeds
//! them through the pricing rules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map};
use sqlx::PgConnection;

use crate::{
    error::AppError,
    models::{from_rows, BookingLine, Discount, ExtraKind, PricingGroup, RentalExtra, Vehicle, VehicleStatus},
    repository::table_service::list_rows,
    schemas::LineSelection,
    services::pricing::{compose_total, line_total, rental_days, vehicle_price, PriceBreakdown},
};

pub async fn load_pricing_groups(
    conn: &mut PgConnection,
    org_id: &str,
) -> Result<HashMap<String, PricingGroup>, AppError> {
    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(org_id));
    let rows = list_rows(&mut *conn, "pricing_groups", Some(&filters), 500, 0, "vehicle_group", true).await?;
    let groups: Vec<PricingGroup> = from_rows(&rows, "pricing_groups")?;
    Ok(groups
        .into_iter()
        .map(|group| (group.vehicle_group.clone(), group))
        .collect())
}

/// A vehicle can be put on a booking only while active. Vehicles the booking
/// already holds keep their place whatever their status.
pub fn check_rentable(vehicle: &Vehicle, already_booked: &[String]) -> Result<(), AppError> {
    if vehicle.status == VehicleStatus::Active || already_booked.contains(&vehicle.id) {
        return Ok(());
    }
    Err(AppError::UnprocessableEntity(format!(
        "Vehicle {} is {} and cannot be rented.",
        vehicle.registration,
        vehicle.status.as_str()
    )))
}

/// Loads the org's vehicles by id, failing when any is unknown or not rentable.
pub async fn load_rentable_vehicles(
    conn: &mut PgConnection,
    org_id: &str,
    vehicle_ids: &[String],
    already_booked: &[String],
) -> Result<Vec<Vehicle>, AppError> {
    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(org_id));
    filters.insert("id".to_string(), json!(vehicle_ids));
    let rows = list_rows(&mut *conn, "vehicles", Some(&filters), 500, 0, "registration", true).await?;
    let found: Vec<Vehicle> = from_rows(&rows, "vehicles")?;

    let mut ordered = Vec::with_capacity(vehicle_ids.len());
    for vehicle_id in vehicle_ids {
        let vehicle = found
            .iter()
            .find(|vehicle| &vehicle.id == vehicle_id)
            .ok_or_else(|| AppError::NotFound(format!("Vehicle {vehicle_id} not found.")))?;
        check_rentable(vehicle, already_booked)?;
        ordered.push(vehicle.clone());
    }
    Ok(ordered)
}

/// Turns catalog selections into priced booking lines of `kind`.
pub async fn resolve_lines(
    conn: &mut PgConnection,
    org_id: &str,
    selections: &[LineSelection],
    kind: ExtraKind,
    days: i64,
) -> Result<Vec<BookingLine>, AppError> {
    if selections.is_empty() {
        return Ok(Vec::new());
    }
    let ids = selections
        .iter()
        .map(|selection| selection.extra_id.clone())
        .collect::<Vec<_>>();
    let mut filters = Map::new();
    filters.insert("organization_id".to_string(), json!(org_id));
    filters.insert("id".to_string(), json!(ids));
    let rows = list_rows(&mut *conn, "rental_extras", Some(&filters), 500, 0, "name", true).await?;
    let catalog: Vec<RentalExtra> = from_rows(&rows, "rental_extras")?;
    lines_from_catalog(&catalog, selections, kind, days)
}

pub fn lines_from_catalog(
    catalog: &[RentalExtra],
    selections: &[LineSelection],
    kind: ExtraKind,
    days: i64,
) -> Result<Vec<BookingLine>, AppError> {
    selections
        .iter()
        .map(|selection| {
            let extra = catalog
                .iter()
                .find(|extra| extra.id == selection.extra_id && extra.is_active)
                .ok_or_else(|| {
                    AppError::UnprocessableEntity(format!(
                        "Extra {} is not available.",
                        selection.extra_id
                    ))
                })?;
            if extra.kind != kind {
                return Err(AppError::UnprocessableEntity(format!(
                    "{} is not listed as an {}.",
                    extra.name,
                    match kind {
                        ExtraKind::Extra => "extra",
                        ExtraKind::Upgrade => "upgrade",
                    }
                )));
            }
            Ok(BookingLine {
                extra_id: Some(extra.id.clone()),
                name: extra.name.clone(),
                unit_price: extra.unit_price,
                price_type: extra.price_type,
                quantity: selection.quantity,
                total_price: line_total(extra.unit_price, extra.price_type, selection.quantity, days),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotedVehicle {
    pub vehicle_id: String,
    pub registration: String,
    pub vehicle_group: Option<String>,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub vehicles: Vec<QuotedVehicle>,
    pub extras: Vec<BookingLine>,
    pub upgrades: Vec<BookingLine>,
    #[serde(flatten)]
    pub breakdown: PriceBreakdown,
}

pub fn price_vehicles(
    groups: &HashMap<String, PricingGroup>,
    vehicles: &[Vehicle],
    days: i64,
    include_insurance: bool,
) -> Result<Vec<QuotedVehicle>, AppError> {
    vehicles
        .iter()
        .map(|vehicle| {
            let price = vehicle
                .vehicle_group
                .as_deref()
                .and_then(|key| groups.get(key))
                .and_then(|group| vehicle_price(group, days, include_insurance))
                .ok_or_else(|| {
                    AppError::UnprocessableEntity(format!(
                        "No pricing group configured for vehicle {}.",
                        vehicle.registration
                    ))
                })?;
            Ok(QuotedVehicle {
                vehicle_id: vehicle.id.clone(),
                registration: vehicle.registration.clone(),
                vehicle_group: vehicle.vehicle_group.clone(),
                price,
            })
        })
        .collect()
}

pub struct QuoteRequest<'a> {
    pub org_id: &'a str,
    pub vehicle_ids: &'a [String],
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    pub extras: &'a [LineSelection],
    pub upgrades: &'a [LineSelection],
    pub include_insurance: bool,
    pub discount: Option<Discount>,
    pub grace_minutes: i64,
}

pub async fn build_quote(conn: &mut PgConnection, request: QuoteRequest<'_>) -> Result<Quote, AppError> {
    let days = rental_days(request.pickup_at, request.return_at, request.grace_minutes)?;
    let vehicles = load_rentable_vehicles(conn, request.org_id, request.vehicle_ids, &[]).await?;
    let groups = load_pricing_groups(conn, request.org_id).await?;
    let priced = price_vehicles(&groups, &vehicles, days, request.include_insurance)?;
    let extras = resolve_lines(conn, request.org_id, request.extras, ExtraKind::Extra, days).await?;
    let upgrades = resolve_lines(conn, request.org_id, request.upgrades, ExtraKind::Upgrade, days).await?;

    let prices = priced.iter().map(|vehicle| vehicle.price).collect::<Vec<_>>();
    let breakdown = compose_total(days, &prices, &extras, &upgrades, request.discount);
    Ok(Quote {
        vehicles: priced,
        extras,
        upgrades,
        breakdown,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{check_rentable, lines_from_catalog, price_vehicles};
    use crate::{
        error::AppError,
        models::{ExtraKind, PriceTier, PriceType, PricingGroup, RentalExtra, Vehicle, VehicleStatus},
        schemas::LineSelection,
    };

    fn extra(id: &str, kind: ExtraKind, price_type: PriceType, unit_price: f64) -> RentalExtra {
        RentalExtra {
            id: id.to_string(),
            organization_id: "o1".to_string(),
            kind,
            name: id.to_string(),
            unit_price,
            price_type,
            is_active: true,
        }
    }

    fn selection(id: &str, quantity: u32) -> LineSelection {
        LineSelection {
            extra_id: id.to_string(),
            quantity,
        }
    }

    #[test]
    fn selections_become_priced_lines() {
        let catalog = vec![
            extra("helmet", ExtraKind::Extra, PriceType::PerDay, 3.0),
            extra("cleaning", ExtraKind::Extra, PriceType::Flat, 15.0),
        ];
        let lines = lines_from_catalog(
            &catalog,
            &[selection("helmet", 2), selection("cleaning", 1)],
            ExtraKind::Extra,
            3,
        )
        .expect("lines");
        assert_eq!(lines[0].total_price, 18.0);
        assert_eq!(lines[1].total_price, 15.0);
    }

    #[test]
    fn wrong_kind_or_inactive_extras_are_rejected() {
        let mut inactive = extra("gps", ExtraKind::Extra, PriceType::Flat, 5.0);
        inactive.is_active = false;
        let catalog = vec![extra("premium", ExtraKind::Upgrade, PriceType::PerDay, 10.0), inactive];
        assert!(lines_from_catalog(&catalog, &[selection("premium", 1)], ExtraKind::Extra, 1).is_err());
        assert!(lines_from_catalog(&catalog, &[selection("gps", 1)], ExtraKind::Extra, 1).is_err());
        assert!(lines_from_catalog(&catalog, &[selection("missing", 1)], ExtraKind::Upgrade, 1).is_err());
    }

    #[test]
    fn vehicles_without_a_group_cannot_be_priced() {
        let group = PricingGroup {
            id: "g1".to_string(),
            organization_id: "o1".to_string(),
            vehicle_group: "scooter-125".to_string(),
            tiers: vec![PriceTier { days: 1, price: 30.0 }],
            extra_day_price: 0.0,
            insurance_per_day: 5.0,
        };
        let groups = HashMap::from([(group.vehicle_group.clone(), group)]);
        let vehicle = |id: &str, group: Option<&str>| Vehicle {
            id: id.to_string(),
            organization_id: "o1".to_string(),
            registration: id.to_uppercase(),
            brand: None,
            model: None,
            vehicle_type: None,
            vehicle_group: group.map(str::to_string),
            status: VehicleStatus::Active,
            insurance_expiry: None,
            itv_expiry: None,
        };

        let priced = price_vehicles(&groups, &[vehicle("v1", Some("scooter-125"))], 2, true).expect("priced");
        assert_eq!(priced[0].price, 70.0);
        assert!(price_vehicles(&groups, &[vehicle("v2", None)], 2, false).is_err());
    }

    #[test]
    fn only_active_vehicles_join_a_booking() {
        let vehicle = |status: VehicleStatus| Vehicle {
            id: "v1".to_string(),
            organization_id: "o1".to_string(),
            registration: "1234-ABC".to_string(),
            brand: None,
            model: None,
            vehicle_type: None,
            vehicle_group: Some("scooter-125".to_string()),
            status,
            insurance_expiry: None,
            itv_expiry: None,
        };
        assert!(check_rentable(&vehicle(VehicleStatus::Active), &[]).is_ok());
        assert!(matches!(
            check_rentable(&vehicle(VehicleStatus::Maintenance), &[]),
            Err(AppError::UnprocessableEntity(_))
        ));
        assert!(check_rentable(&vehicle(VehicleStatus::Inactive), &[]).is_err());

        let held = vec!["v1".to_string()];
        assert!(check_rentable(&vehicle(VehicleStatus::Maintenance), &held).is_ok());
    }
}
