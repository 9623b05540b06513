use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};

use crate::config::Config;

pub type Db = Pool<Postgres>;

pub async fn connect(config: &Config) -> Result<Db> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.store_timeout)
        .connect(&config.database_url)
        .await
        .context("failed to connect to DATABASE_URL")
}

/// Creates the collections and their unique indexes. Must finish before the
/// listener accepts traffic.
pub async fn prepare_schema(db: &Db) -> Result<()> {
    // crate-relative path for sqlx migrations
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .context("failed to run migrations")
}
