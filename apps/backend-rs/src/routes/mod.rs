use axum::{routing::get, Router};
use chrono::{NaiveDate, Utc};

use crate::{services::templates::parse_timezone, state::AppState};

pub mod availability;
pub mod booking;
pub mod bookings;
pub mod contracts;
pub mod customers;
pub mod deposits;
pub mod extras;
pub mod health;
pub mod inspections;
pub mod invoices;
pub mod maintenance;
pub mod organizations;
pub mod payments;
pub mod pricing;
pub mod uploads;
pub mod vehicles;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(organizations::router())
        .merge(customers::router())
        .merge(vehicles::router())
        .merge(maintenance::router())
        .merge(pricing::router())
        .merge(extras::router())
        .merge(availability::router())
        .merge(bookings::router())
        .merge(payments::router())
        .merge(deposits::router())
        .merge(inspections::router())
        .merge(contracts::router())
        .merge(invoices::router())
        .merge(booking::router())
}

/// Calendar date in the given (or default) timezone, for expiry checks.
pub(crate) fn local_today(state: &AppState, timezone: Option<&str>) -> NaiveDate {
    let tz = parse_timezone(timezone, &state.config.default_timezone);
    Utc::now().with_timezone(&tz).date_naive()
}
