use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Postgres, Row};

use crate::{error::AppError, models::BLOCKING_BOOKING_STATUSES};

/// Half-open intervals: `[a_start, a_end)` and `[b_start, b_end)`.
pub fn windows_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookedWindow {
    pub booking_id: String,
    pub vehicle_id: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    pub status: String,
}

/// Windows that block `[pickup_at, return_at)`, ignoring `exclude_booking_id`.
pub fn blocking_windows<'a>(
    windows: &'a [BookedWindow],
    pickup_at: DateTime<Utc>,
    return_at: DateTime<Utc>,
    exclude_booking_id: Option<&'a str>,
) -> impl Iterator<Item = &'a BookedWindow> {
    windows.iter().filter(move |window| {
        Some(window.booking_id.as_str()) != exclude_booking_id
            && BLOCKING_BOOKING_STATUSES.contains(&window.status.as_str())
            && windows_overlap(pickup_at, return_at, window.pickup_at, window.return_at)
    })
}

/// Ids from `vehicle_ids` that no blocking window touches.
pub fn free_vehicle_ids(
    vehicle_ids: &[String],
    windows: &[BookedWindow],
    pickup_at: DateTime<Utc>,
    return_at: DateTime<Utc>,
    exclude_booking_id: Option<&str>,
) -> Vec<String> {
    let busy = blocking_windows(windows, pickup_at, return_at, exclude_booking_id)
        .map(|window| window.vehicle_id.as_str())
        .collect::<HashSet<_>>();
    vehicle_ids
        .iter()
        .filter(|id| !busy.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Loads booked windows of `vehicle_ids` (all org vehicles when `None`) that
/// intersect `[from, to)`.
pub async fn load_booked_windows<'c, E>(
    executor: E,
    org_id: &str,
    vehicle_ids: Option<&[String]>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<BookedWindow>, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query(
        "SELECT b.id::text AS booking_id,
                bv.vehicle_id::text AS vehicle_id,
                b.pickup_at,
                b.return_at,
                b.status
         FROM booking_vehicles bv
         JOIN bookings b ON b.id = bv.booking_id
         WHERE b.organization_id = $1::uuid
           AND b.status = ANY($2)
           AND b.pickup_at < $4
           AND b.return_at > $3
           AND ($5::text[] IS NULL OR bv.vehicle_id::text = ANY($5))",
    )
    .bind(org_id)
    .bind(
        BLOCKING_BOOKING_STATUSES
            .iter()
            .map(|status| status.to_string())
            .collect::<Vec<_>>(),
    )
    .bind(from)
    .bind(to)
    .bind(vehicle_ids.map(<[String]>::to_vec))
    .fetch_all(executor)
    .await
    .map_err(|error| {
        tracing::error!(org_id, error = %error, "Could not load booked windows");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    rows.into_iter()
        .map(|row| {
            Ok(BookedWindow {
                booking_id: row.try_get("booking_id").map_err(read_error)?,
                vehicle_id: row.try_get("vehicle_id").map_err(read_error)?,
                pickup_at: row.try_get("pickup_at").map_err(read_error)?,
                return_at: row.try_get("return_at").map_err(read_error)?,
                status: row.try_get("status").map_err(read_error)?,
            })
        })
        .collect()
}

fn read_error(error: sqlx::Error) -> AppError {
    tracing::error!(error = %error, "Unexpected booked window row");
    AppError::Internal("Could not read booking windows.".to_string())
}

/// Rejects the request when any of `vehicle_ids` is booked in the window.
pub fn ensure_vehicles_free(
    vehicle_ids: &[String],
    windows: &[BookedWindow],
    pickup_at: DateTime<Utc>,
    return_at: DateTime<Utc>,
    exclude_booking_id: Option<&str>,
) -> Result<(), AppError> {
    let conflicts = blocking_windows(windows, pickup_at, return_at, exclude_booking_id)
        .filter(|window| vehicle_ids.contains(&window.vehicle_id))
        .collect::<Vec<_>>();
    if conflicts.is_empty() {
        return Ok(());
    }
    Err(AppError::Blocked {
        message: "One or more vehicles are already booked for this period.".to_string(),
        details: serde_json::json!({ "conflicts": conflicts }),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::{ensure_vehicles_free, free_vehicle_ids, windows_overlap, BookedWindow};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, day, hour, 0, 0).unwrap()
    }

    fn window(booking: &str, vehicle: &str, from: DateTime<Utc>, to: DateTime<Utc>, status: &str) -> BookedWindow {
        BookedWindow {
            booking_id: booking.to_string(),
            vehicle_id: vehicle.to_string(),
            pickup_at: from,
            return_at: to,
            status: status.to_string(),
        }
    }

    #[test]
    fn back_to_back_windows_do_not_overlap() {
        assert!(!windows_overlap(at(1, 10), at(3, 10), at(3, 10), at(5, 10)));
        assert!(!windows_overlap(at(3, 10), at(5, 10), at(1, 10), at(3, 10)));
        assert!(windows_overlap(at(1, 10), at(3, 11), at(3, 10), at(5, 10)));
        assert!(windows_overlap(at(1, 10), at(9, 10), at(3, 10), at(5, 10)));
    }

    #[test]
    fn filters_out_overlapping_vehicles_only() {
        let vehicles = vec!["v1".to_string(), "v2".to_string(), "v3".to_string()];
        let windows = vec![
            window("b1", "v1", at(1, 10), at(3, 10), "confirmed"),
            window("b2", "v2", at(2, 9), at(4, 9), "in_progress"),
            window("b3", "v3", at(2, 9), at(4, 9), "cancelled"),
        ];
        let free = free_vehicle_ids(&vehicles, &windows, at(3, 10), at(5, 10), None);
        assert_eq!(free, vec!["v1".to_string(), "v3".to_string()]);
    }

    #[test]
    fn excluded_booking_does_not_block_itself() {
        let vehicles = vec!["v1".to_string()];
        let windows = vec![window("b1", "v1", at(1, 10), at(3, 10), "pending")];
        assert!(free_vehicle_ids(&vehicles, &windows, at(2, 10), at(4, 10), None).is_empty());
        assert_eq!(
            free_vehicle_ids(&vehicles, &windows, at(2, 10), at(4, 10), Some("b1")),
            vehicles
        );
    }

    #[test]
    fn conflicts_are_reported_as_blocked() {
        let windows = vec![window("b1", "v1", at(1, 10), at(3, 10), "confirmed")];
        let error = ensure_vehicles_free(&["v1".to_string()], &windows, at(2, 10), at(4, 10), None)
            .expect_err("overlap");
        assert_eq!(error.status_code(), axum::http::StatusCode::CONFLICT);
        assert!(ensure_vehicles_free(&["v2".to_string()], &windows, at(2, 10), at(4, 10), None).is_ok());
    }
}
