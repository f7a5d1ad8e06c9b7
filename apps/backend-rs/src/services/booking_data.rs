//! Typed loaders for a booking and the records hanging off it.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    error::AppError,
    models::{
        from_row, from_rows, Booking, BookingVehicle, Contract, Customer, CustomerDocument,
        CustomerDocumentType, Deposit, Inspection, InspectionKind, Organization, Payment, Vehicle,
    },
    repository::table_service::{get_row, list_rows},
};

fn filter(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

pub async fn load_booking(conn: &mut PgConnection, booking_id: &str) -> Result<(Value, Booking), AppError> {
    let row = get_row(&mut *conn, "bookings", booking_id, "id").await?;
    let booking = from_row(&row, "bookings")?;
    Ok((row, booking))
}

pub async fn load_organization(conn: &mut PgConnection, org_id: &str) -> Result<Organization, AppError> {
    let row = get_row(&mut *conn, "organizations", org_id, "id").await?;
    from_row(&row, "organizations")
}

pub async fn load_customer(conn: &mut PgConnection, customer_id: &str) -> Result<Customer, AppError> {
    let row = get_row(&mut *conn, "customers", customer_id, "id").await?;
    from_row(&row, "customers")
}

pub async fn load_customer_documents(
    conn: &mut PgConnection,
    customer_id: &str,
) -> Result<Vec<CustomerDocument>, AppError> {
    let rows = list_rows(
        &mut *conn,
        "customer_documents",
        Some(&filter(&[("customer_id", json!(customer_id))])),
        50,
        0,
        "created_at",
        true,
    )
    .await?;
    from_rows(&rows, "customer_documents")
}

pub fn document_types(documents: &[CustomerDocument]) -> HashSet<CustomerDocumentType> {
    documents.iter().map(|document| document.document_type).collect()
}

pub async fn load_payments(conn: &mut PgConnection, booking_id: &str) -> Result<Vec<Payment>, AppError> {
    let rows = list_rows(
        &mut *conn,
        "payments",
        Some(&filter(&[("booking_id", json!(booking_id))])),
        1000,
        0,
        "paid_at",
        true,
    )
    .await?;
    from_rows(&rows, "payments")
}

pub async fn load_deposits(conn: &mut PgConnection, booking_id: &str) -> Result<Vec<Deposit>, AppError> {
    let rows = list_rows(
        &mut *conn,
        "deposits",
        Some(&filter(&[("booking_id", json!(booking_id))])),
        10,
        0,
        "created_at",
        true,
    )
    .await?;
    from_rows(&rows, "deposits")
}

pub async fn load_contract(conn: &mut PgConnection, booking_id: &str) -> Result<Option<Contract>, AppError> {
    let rows = list_rows(
        &mut *conn,
        "contracts",
        Some(&filter(&[("booking_id", json!(booking_id))])),
        1,
        0,
        "created_at",
        true,
    )
    .await?;
    rows.first().map(|row| from_row(row, "contracts")).transpose()
}

pub async fn load_return_inspections(
    conn: &mut PgConnection,
    booking_id: &str,
) -> Result<Vec<Inspection>, AppError> {
    let rows = list_rows(
        &mut *conn,
        "inspections",
        Some(&filter(&[
            ("booking_id", json!(booking_id)),
            ("kind", json!(InspectionKind::Return.as_str())),
        ])),
        50,
        0,
        "inspected_at",
        false,
    )
    .await?;
    from_rows(&rows, "inspections")
}

/// Vehicles on a booking with the price stored for each.
pub async fn load_booking_vehicles(
    conn: &mut PgConnection,
    booking_id: &str,
) -> Result<Vec<(Vehicle, f64)>, AppError> {
    let links: Vec<BookingVehicle> = from_rows(
        &list_rows(
            &mut *conn,
            "booking_vehicles",
            Some(&filter(&[("booking_id", json!(booking_id))])),
            50,
            0,
            "created_at",
            true,
        )
        .await?,
        "booking_vehicles",
    )?;
    if links.is_empty() {
        return Ok(Vec::new());
    }

    let ids = links
        .iter()
        .map(|link| json!(link.vehicle_id))
        .collect::<Vec<_>>();
    let vehicles: Vec<Vehicle> = from_rows(
        &list_rows(
            &mut *conn,
            "vehicles",
            Some(&filter(&[("id", Value::Array(ids))])),
            50,
            0,
            "registration",
            true,
        )
        .await?,
        "vehicles",
    )?;
    let mut by_id = vehicles
        .into_iter()
        .map(|vehicle| (vehicle.id.clone(), vehicle))
        .collect::<HashMap<_, _>>();

    Ok(links
        .into_iter()
        .filter_map(|link| by_id.remove(&link.vehicle_id).map(|vehicle| (vehicle, link.price)))
        .collect())
}
