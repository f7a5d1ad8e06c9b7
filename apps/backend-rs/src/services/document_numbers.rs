use sqlx::{PgConnection, Row};

use crate::error::AppError;

pub const CONTRACT_PREFIX: &str = "C";

pub fn format_document_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{prefix}-{year}-{sequence:05}")
}

/// Allocates the next number for `(org, prefix, year)`. The row lock taken by
/// the upsert serializes concurrent allocations until the transaction ends.
pub async fn next_document_number(
    conn: &mut PgConnection,
    org_id: &str,
    prefix: &str,
    year: i32,
) -> Result<String, AppError> {
    let row = sqlx::query(
        "INSERT INTO document_sequences (organization_id, prefix, year, last_value)
         VALUES ($1::uuid, $2, $3, 1)
         ON CONFLICT (organization_id, prefix, year)
         DO UPDATE SET last_value = document_sequences.last_value + 1
         RETURNING last_value",
    )
    .bind(org_id)
    .bind(prefix)
    .bind(year)
    .fetch_one(&mut *conn)
    .await
    .map_err(|error| {
        tracing::error!(org_id, prefix, year, error = %error, "Could not allocate document number");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let sequence = row.try_get::<i64, _>("last_value").map_err(|error| {
        AppError::Internal(format!("Unexpected sequence row: {error}"))
    })?;
    Ok(format_document_number(prefix, year, sequence))
}

#[cfg(test)]
mod tests {
    use super::format_document_number;

    #[test]
    fn numbers_are_zero_padded_per_year() {
        assert_eq!(format_document_number("F", 2026, 7), "F-2026-00007");
        assert_eq!(format_document_number("T", 2027, 123456), "T-2027-123456");
    }
}
