//! Append-only send log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::trace;

use super::{format_timestamp, StoreError};

/// Row type returned by SQLite queries for send logs.
type LogRow = (i64, i64, i64, Option<i64>, String, Option<String>, String);

/// Status recorded for one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    /// Accepted by the transport.
    Sent,
    /// Rejected by the transport.
    Failed,
    /// Delivery receipt observed.
    Delivered,
    /// Read receipt observed.
    Read,
}

impl LogStatus {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    /// Parse a string into a log status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] if the string is unrecognized.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(StoreError::InvalidEnum {
                field: "log status",
                value: other.to_owned(),
            }),
        }
    }
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendLog {
    /// Database row id.
    pub id: i64,
    /// Campaign the attempt belonged to.
    pub campaign_id: i64,
    /// Recipient addressed.
    pub recipient_id: i64,
    /// Step that was sent.
    pub step_id: Option<i64>,
    /// Outcome.
    pub status: LogStatus,
    /// Error text for failed attempts.
    pub error_message: Option<String>,
    /// When the attempt was recorded.
    pub timestamp: String,
}

fn from_row(row: LogRow) -> Result<SendLog, StoreError> {
    let (id, campaign_id, recipient_id, step_id, status, error_message, timestamp) = row;
    Ok(SendLog {
        id,
        campaign_id,
        recipient_id,
        step_id,
        status: LogStatus::parse(&status)?,
        error_message,
        timestamp,
    })
}

/// Append a log row inside an open transaction.
pub(crate) async fn append(
    tx: &mut Transaction<'_, Sqlite>,
    campaign_id: i64,
    recipient_id: i64,
    step_id: Option<i64>,
    status: LogStatus,
    error_message: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO send_logs (campaign_id, recipient_id, step_id, status, error_message) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(campaign_id)
    .bind(recipient_id)
    .bind(step_id)
    .bind(status.as_str())
    .bind(error_message)
    .execute(&mut **tx)
    .await?;
    trace!(campaign_id, recipient_id, status = status.as_str(), "send log appended");
    Ok(())
}

/// Count log rows of a campaign with `status` recorded at or after `since`.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn count_since(
    db: &SqlitePool,
    campaign_id: i64,
    status: LogStatus,
    since: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM send_logs \
         WHERE campaign_id = ?1 AND status = ?2 AND timestamp >= ?3",
    )
    .bind(campaign_id)
    .bind(status.as_str())
    .bind(format_timestamp(since))
    .fetch_one(db)
    .await?;
    Ok(count.cast_unsigned())
}

/// Count every log row of a campaign with the given status.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn count(
    db: &SqlitePool,
    campaign_id: i64,
    status: LogStatus,
) -> Result<u64, StoreError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM send_logs WHERE campaign_id = ?1 AND status = ?2")
            .bind(campaign_id)
            .bind(status.as_str())
            .fetch_one(db)
            .await?;
    Ok(count.cast_unsigned())
}

/// Log rows of one recipient in insertion order.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn for_recipient(db: &SqlitePool, recipient_id: i64) -> Result<Vec<SendLog>, StoreError> {
    let rows: Vec<LogRow> = sqlx::query_as(
        "SELECT id, campaign_id, recipient_id, step_id, status, error_message, timestamp \
         FROM send_logs WHERE recipient_id = ?1 ORDER BY id ASC",
    )
    .bind(recipient_id)
    .fetch_all(db)
    .await?;
    rows.into_iter().map(from_row).collect()
}

/// Log rows of one campaign in insertion order.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn for_campaign(db: &SqlitePool, campaign_id: i64) -> Result<Vec<SendLog>, StoreError> {
    let rows: Vec<LogRow> = sqlx::query_as(
        "SELECT id, campaign_id, recipient_id, step_id, status, error_message, timestamp \
         FROM send_logs WHERE campaign_id = ?1 ORDER BY id ASC",
    )
    .bind(campaign_id)
    .fetch_all(db)
    .await?;
    rows.into_iter().map(from_row).collect()
}
