//! Database access layer for PostgreSQL.

use crate::config::DatabaseConfig;
use crate::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::path::Path;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// Run database migrations from the migrations directory.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(Path::new("./migrations")).await?;
    migrator.run(pool).await?;
    Ok(())
}

/// Map a sqlx failure onto the engine's error kinds.
///
/// Connection-level failures become `StoreUnavailable` so callers can
/// apply their retry policy; everything else is passed through.
pub fn classify(err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Io(e) => Error::store(e.to_string()),
        sqlx::Error::PoolTimedOut => Error::store("connection pool timed out"),
        sqlx::Error::PoolClosed => Error::store("connection pool closed"),
        other => Error::Database(other),
    }
}
