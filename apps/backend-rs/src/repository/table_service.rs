use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Executor, PgConnection, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "audit_logs",
    "booking_vehicles",
    "bookings",
    "contracts",
    "customer_documents",
    "customers",
    "deposits",
    "document_sequences",
    "inspection_photos",
    "inspections",
    "invoices",
    "maintenance_expenses",
    "maintenance_records",
    "organization_members",
    "organizations",
    "payments",
    "pricing_groups",
    "rental_extras",
    "vehicle_documents",
    "vehicles",
];

pub async fn list_rows<'c, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    push_filters(&mut query, filters)?;

    query
        .push(" ORDER BY t.")
        .push(order_name)
        .push(if ascending { " ASC" } else { " DESC" })
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query
        .build()
        .fetch_all(executor)
        .await
        .map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row<'c, E>(
    executor: E,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    fetch_by_id(executor, table, row_id, id_field, false).await
}

/// Reads a row with `FOR UPDATE`, holding the lock until the transaction ends.
pub async fn lock_row(
    conn: &mut PgConnection,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    fetch_by_id(&mut *conn, table, row_id, id_field, true).await
}

async fn fetch_by_id<'c, E>(
    executor: E,
    table: &str,
    row_id: &str,
    id_field: &str,
    for_update: bool,
) -> Result<Value, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_id_filter(&mut query, id_name, row_id);
    query.push(" LIMIT 1");
    if for_update {
        query.push(" FOR UPDATE");
    }

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row<'c, E>(
    executor: E,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let mut query = insert_query(table_name, payload)?;

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row<'c, E>(
    executor: E,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    let mut query = update_query(table_name, payload)?;
    query.push(" WHERE ");
    push_id_filter(&mut query, id_name, row_id);
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Deletes one row and returns it as it was.
pub async fn delete_row<'c, E>(
    executor: E,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_id_filter(&mut query, id_name, row_id);
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(executor)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Deletes every row matching `filters`. An empty filter set is rejected.
pub async fn delete_where<'c, E>(
    executor: E,
    table: &str,
    filters: &Map<String, Value>,
) -> Result<u64, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let table_name = validate_table(table)?;
    if filters.values().all(Value::is_null) {
        return Err(AppError::BadRequest(
            "Refusing to delete without filters.".to_string(),
        ));
    }

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    push_filters(&mut query, Some(filters))?;

    let result = query
        .build()
        .execute(executor)
        .await
        .map_err(map_db_error)?;
    Ok(result.rows_affected())
}

pub async fn count_rows<'c, E>(
    executor: E,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError>
where
    E: Executor<'c, Database = Postgres>,
{
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    push_filters(&mut query, filters)?;

    let row = query
        .build()
        .fetch_one(executor)
        .await
        .map_err(map_db_error)?;

    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

// jsonb_populate_record lets PostgreSQL resolve column types (uuid, numeric,
// jsonb, timestamptz ...) from the table definition.
fn insert_query<'a>(
    table_name: &'a str,
    payload: &Map<String, Value>,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let columns = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (").push(columns.join(", "));
    query.push(") SELECT ");
    query.push(
        columns
            .iter()
            .map(|column| format!("r.{column}"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    Ok(query)
}

fn update_query<'a>(
    table_name: &'a str,
    payload: &Map<String, Value>,
) -> Result<QueryBuilder<'a, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let columns = sorted_columns(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    query.push(
        columns
            .iter()
            .map(|column| format!("{column} = r.{column}"))
            .collect::<Vec<_>>()
            .join(", "),
    );
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r");
    Ok(query)
}

fn sorted_columns(payload: &Map<String, Value>) -> Result<Vec<String>, AppError> {
    let mut columns = payload
        .keys()
        .map(|key| validate_identifier(key).map(ToOwned::to_owned))
        .collect::<Result<Vec<_>, _>>()?;
    columns.sort_unstable();
    Ok(columns)
}

fn push_id_filter(query: &mut QueryBuilder<Postgres>, id_name: &str, row_id: &str) {
    let value = infer_scalar_filter(id_name, &Value::String(row_id.to_string()));
    push_scalar_filter(query, id_name, FilterOperator::Eq, &value);
}

fn push_filters(
    query: &mut QueryBuilder<Postgres>,
    filters: Option<&Map<String, Value>>,
) -> Result<(), AppError> {
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(query, key, value)?;
        }
    }
    Ok(())
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !trimmed.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(trimmed)
    } else {
        Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )))
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, PartialEq)]
enum ArrayFilter {
    Text(Vec<String>),
    Uuid(Vec<uuid::Uuid>),
}

impl ArrayFilter {
    fn is_empty(&self) -> bool {
        match self {
            Self::Text(values) => values.is_empty(),
            Self::Uuid(values) => values.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    ILike,
    IsNull,
}

impl FilterOperator {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq => " = ",
            Self::Neq => " <> ",
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
            Self::ILike => " ILIKE ",
            Self::IsNull => " IS NULL",
        }
    }
}

/// `column`, `column__gte`, `column__ilike`, `column__is_null`, ...
fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let parsed = filter_key.rsplit_once("__").and_then(|(column, suffix)| {
        let operator = match suffix {
            "ne" => FilterOperator::Neq,
            "gt" => FilterOperator::Gt,
            "gte" => FilterOperator::Gte,
            "lt" => FilterOperator::Lt,
            "lte" => FilterOperator::Lte,
            "ilike" => FilterOperator::ILike,
            "is_null" => FilterOperator::IsNull,
            "in" => FilterOperator::Eq,
            _ => return None,
        };
        Some((column, operator))
    });
    let (column, operator) = parsed.unwrap_or((filter_key, FilterOperator::Eq));
    Ok((validate_identifier(column)?, operator))
}

fn parse_bool_filter_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|parsed| parsed != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if operator == FilterOperator::IsNull {
        query.push(" AND t.").push(column);
        if parse_bool_filter_value(value) {
            query.push(" IS NULL");
        } else {
            query.push(" IS NOT NULL");
        }
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if operator != FilterOperator::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            let filter = infer_array_filter(column, items);
            if !filter.is_empty() {
                query.push(" AND ");
                push_array_filter(query, column, &filter);
            }
            Ok(())
        }
        _ => {
            query.push(" AND ");
            let filter = infer_scalar_filter(column, value);
            push_scalar_filter(query, column, operator, &filter);
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ScalarFilter,
) {
    query.push("t.").push(column);
    if operator == FilterOperator::ILike {
        query.push("::text ILIKE ").push_bind(scalar_to_text(value));
        return;
    }

    let sql_operator = operator.sql();
    match value {
        ScalarFilter::Text(text) => {
            query.push("::text").push(sql_operator).push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(sql_operator).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(sql_operator).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::F64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(sql_operator).push_bind(*date);
        }
        ScalarFilter::Timestamp(timestamp) => {
            query.push(sql_operator).push_bind(*timestamp);
        }
    }
}

fn scalar_to_text(value: &ScalarFilter) -> String {
    match value {
        ScalarFilter::Text(text) => text.clone(),
        ScalarFilter::Uuid(id) => id.to_string(),
        ScalarFilter::Bool(flag) => flag.to_string(),
        ScalarFilter::I64(number) => number.to_string(),
        ScalarFilter::F64(number) => number.to_string(),
        ScalarFilter::Date(date) => date.to_string(),
        ScalarFilter::Timestamp(timestamp) => timestamp.to_rfc3339(),
    }
}

fn push_array_filter(query: &mut QueryBuilder<Postgres>, column: &str, value: &ArrayFilter) {
    query.push("t.").push(column);
    match value {
        ArrayFilter::Text(values) => {
            query
                .push("::text = ANY(")
                .push_bind(values.clone())
                .push(")");
        }
        ArrayFilter::Uuid(values) => {
            query.push(" = ANY(").push_bind(values.clone()).push(")");
        }
    }
}

fn infer_scalar_filter(column: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(ScalarFilter::I64)
            .or_else(|| number.as_f64().map(ScalarFilter::F64))
            .unwrap_or_else(|| ScalarFilter::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_column(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_timestamp_column(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if is_date_column(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        _ => ScalarFilter::Text(render_scalar(value)),
    }
}

fn infer_array_filter(column: &str, values: &[Value]) -> ArrayFilter {
    if is_uuid_column(column) {
        let parsed = values
            .iter()
            .map(|value| value.as_str().and_then(|text| uuid::Uuid::parse_str(text.trim()).ok()))
            .collect::<Option<Vec<_>>>();
        if let Some(ids) = parsed {
            return ArrayFilter::Uuid(ids);
        }
    }
    ArrayFilter::Text(values.iter().map(render_scalar).collect())
}

fn is_uuid_column(column: &str) -> bool {
    column == "id" || column.ends_with("_id")
}

fn is_date_column(column: &str) -> bool {
    column.ends_with("_date") || column.ends_with("_expiry") || column.ends_with("_on")
}

fn is_timestamp_column(column: &str) -> bool {
    column.ends_with("_at")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    if let Some(db_error) = error.as_database_error() {
        match db_error.code().as_deref() {
            Some("23505") => {
                tracing::warn!(db_error = %db_error, "Unique constraint violated");
                return AppError::Conflict(
                    "Duplicate value violates a unique constraint.".to_string(),
                );
            }
            Some("23503") => {
                tracing::warn!(db_error = %db_error, "Foreign key constraint violated");
                return AppError::Conflict(
                    "Record is referenced by or references a missing record.".to_string(),
                );
            }
            Some("23514") | Some("22P02") => {
                tracing::warn!(db_error = %db_error, "Value rejected by the database");
                return AppError::BadRequest("Invalid value for this field.".to_string());
            }
            _ => {}
        }
    }
    tracing::error!(db_error = %error, "Database query failed");
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{
        infer_array_filter, infer_scalar_filter, insert_query, parse_filter_key, push_filter_clause,
        update_query, validate_table, ArrayFilter, FilterOperator, ScalarFilter,
    };

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn insert_uses_jsonb_populate_record_with_sorted_columns() {
        let query = insert_query(
            "customers",
            &payload(json!({"full_name": "Ana", "email": "ana@example.com"})),
        )
        .expect("query");
        let sql = query.sql();
        assert!(sql.starts_with("INSERT INTO customers (email, full_name) SELECT r.email, r.full_name"));
        assert!(sql.contains("jsonb_populate_record(NULL::customers, $1)"));
        assert!(sql.ends_with("RETURNING row_to_json(customers.*) AS row"));
    }

    #[test]
    fn update_sets_each_column_from_record() {
        let query = update_query(
            "bookings",
            &payload(json!({"status": "confirmed", "notes": "late"})),
        )
        .expect("query");
        assert!(query.sql().contains("SET notes = r.notes, status = r.status FROM"));
    }

    #[test]
    fn empty_payloads_are_rejected() {
        assert!(insert_query("bookings", &Map::new()).is_err());
        assert!(update_query("bookings", &Map::new()).is_err());
    }

    #[test]
    fn unknown_tables_and_bad_identifiers_are_rejected() {
        assert!(validate_table("bookings").is_ok());
        assert!(validate_table("pg_shadow").is_err());
        assert!(validate_table("bookings; drop").is_err());
        assert!(insert_query("customers", &payload(json!({"Full Name": "x"}))).is_err());
    }

    #[test]
    fn filter_suffixes_map_to_operators() {
        assert_eq!(
            parse_filter_key("pickup_at__lt").expect("key"),
            ("pickup_at", FilterOperator::Lt)
        );
        assert_eq!(
            parse_filter_key("status__in").expect("key"),
            ("status", FilterOperator::Eq)
        );
        assert_eq!(
            parse_filter_key("odd__suffix").expect("key"),
            ("odd__suffix", FilterOperator::Eq)
        );
    }

    #[test]
    fn infers_typed_scalars_from_column_names() {
        assert!(matches!(
            infer_scalar_filter("vehicle_id", &json!("550e8400-e29b-41d4-a716-446655440000")),
            ScalarFilter::Uuid(_)
        ));
        assert!(matches!(
            infer_scalar_filter("return_at", &json!("2026-07-01T10:00:00Z")),
            ScalarFilter::Timestamp(_)
        ));
        assert!(matches!(
            infer_scalar_filter("itv_expiry", &json!("2026-07-01")),
            ScalarFilter::Date(_)
        ));
        assert_eq!(
            infer_scalar_filter("status", &json!("held")),
            ScalarFilter::Text("held".to_string())
        );
    }

    #[test]
    fn array_filters_fall_back_to_text() {
        assert!(matches!(
            infer_array_filter("booking_id", &[json!("550e8400-e29b-41d4-a716-446655440000")]),
            ArrayFilter::Uuid(_)
        ));
        assert_eq!(
            infer_array_filter("status", &[json!("pending"), json!("confirmed")]),
            ArrayFilter::Text(vec!["pending".to_string(), "confirmed".to_string()])
        );
    }

    #[test]
    fn null_filters_are_skipped_and_is_null_renders() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM deposits t WHERE 1=1");
        push_filter_clause(&mut query, "status", &Value::Null).expect("skip");
        push_filter_clause(&mut query, "returned_at__is_null", &json!(true)).expect("null");
        assert_eq!(
            query.sql(),
            "SELECT 1 FROM deposits t WHERE 1=1 AND t.returned_at IS NULL"
        );
    }
}
