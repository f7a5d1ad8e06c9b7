use std::time::Duration;

use sqlx::{pool::PoolConnection, postgres::PgPoolOptions, PgPool, Postgres, Transaction};

use crate::{config::AppConfig, error::AppError, state::AppState};

/// Builds a lazily connecting pool; `None` when no database URL is configured.
pub fn build_pool(config: &AppConfig) -> Result<Option<PgPool>, sqlx::Error> {
    let Some(url) = config.database_url.as_deref() else {
        return Ok(None);
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max_connections)
        .min_connections(config.db_pool_min_connections)
        .acquire_timeout(Duration::from_secs(config.db_pool_acquire_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.db_pool_idle_timeout_seconds))
        .connect_lazy(url)?;
    Ok(Some(pool))
}

pub fn db_pool(state: &AppState) -> Result<&PgPool, AppError> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

pub async fn begin(state: &AppState) -> Result<Transaction<'static, Postgres>, AppError> {
    db_pool(state)?.begin().await.map_err(|error| {
        tracing::error!(error = %error, "Could not start transaction");
        AppError::Dependency("Database operation failed.".to_string())
    })
}

pub async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), AppError> {
    tx.commit().await.map_err(|error| {
        tracing::error!(error = %error, "Could not commit transaction");
        AppError::Dependency("Database operation failed.".to_string())
    })
}

pub async fn acquire(state: &AppState) -> Result<PoolConnection<Postgres>, AppError> {
    db_pool(state)?.acquire().await.map_err(|error| {
        tracing::error!(error = %error, "Could not acquire database connection");
        AppError::Dependency("Database operation failed.".to_string())
    })
}
