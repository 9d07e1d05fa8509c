//! SQLite persistence for connections, campaigns, steps, recipients, and send logs.
//!
//! # SQLite Write Pattern
//!
//! All tables are written directly through the pool. Connection rows are only
//! written by the connection supervisor of their tenant, and recipient / log rows
//! are only written by the processing loop of their campaign, so there is no
//! cross-writer contention on a single row. Multi-row updates that must stay
//! consistent (recipient progress plus its log row) run in one transaction.
//!
//! The schema is applied inline via `include_str!` on every open; all statements
//! are `CREATE ... IF NOT EXISTS`.

pub mod campaigns;
pub mod connections;
pub mod recipients;
pub mod send_log;

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Schema applied on every open.
const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

/// Maximum pool size for file-backed databases.
const MAX_CONNECTIONS: u32 = 4;

/// Timestamp layout produced by SQLite's `datetime('now')`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// The requested campaign does not exist.
    #[error("campaign not found: {0}")]
    CampaignNotFound(i64),

    /// The requested connection does not exist.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// A persisted integer does not fit the in-memory type.
    #[error("value out of range for {field}: {value}")]
    OutOfRange {
        /// Which field contained the bad value.
        field: &'static str,
        /// The offending value.
        value: i64,
    },
}

/// Open (or create) the database at `path` and apply the schema.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created, the database
/// cannot be opened, or the schema fails to apply.
pub async fn open(path: &Path) -> anyhow::Result<SqlitePool> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .pragma("trusted_schema", "OFF")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    apply_schema(&pool)
        .await
        .context("failed to apply courier schema")?;

    info!(path = %path.display(), "store opened");
    Ok(pool)
}

/// Open a private in-memory database with the schema applied.
///
/// Uses a single connection so every query sees the same in-memory database.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the pool cannot be created.
pub async fn open_in_memory() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// Apply the bundled schema to an existing pool.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if any statement fails.
pub async fn apply_schema(db: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA_SQL).execute(db).await?;
    Ok(())
}

/// Format a UTC instant the way SQLite's `datetime()` does, so that text
/// comparisons against stored timestamps are chronological.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Convert a non-negative `i64` column into `u32`.
pub(crate) fn to_u32(field: &'static str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::OutOfRange { field, value })
}

/// Convert a non-negative `i64` column into `u64`.
pub(crate) fn to_u64(field: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange { field, value })
}
