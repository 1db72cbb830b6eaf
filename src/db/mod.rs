//! Durable store: SQLite pool, migrations, and per-entity repositories.

pub mod tx;

pub mod agents;
pub mod assignments;
pub mod channels;
pub mod conversation_cost;
pub mod jobs;
pub mod leases;
pub mod messages;
pub mod organizations;
pub mod users;

pub use tx::TransactionManager;

use crate::error::{DbError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Open (creating if absent) the SQLite database at `path` and run pending
/// migrations.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|e| DbError::Connect(e))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(DbError::Connect)?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| DbError::Migration(e.to_string()))?;

    Ok(pool)
}

/// Open an in-memory pool for tests, with migrations applied.
#[cfg(test)]
pub async fn connect_in_memory() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should connect");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations should apply to in-memory db");

    pool
}
