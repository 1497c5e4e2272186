use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::Config;

/// Connect a bounded Postgres pool. Shared across all requests; every
/// transaction in the core holds row-level locks only.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;

    Ok(pool)
}
