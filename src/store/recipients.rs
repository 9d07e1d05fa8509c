//! Recipient rows and their progress through a campaign's steps.
//!
//! Recipient progress and the matching send-log row are always written in the
//! same transaction, so `current_step` equals the number of `sent` log rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::trace;

use super::send_log::{self, LogStatus};
use super::{format_timestamp, to_u32, StoreError};

/// Row type returned by SQLite queries for recipients.
type RecipientRow = (
    i64,
    i64,
    String,
    Option<String>,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

const RECIPIENT_COLUMNS: &str = "SELECT id, campaign_id, phone_number, name, current_step, \
     status, last_sent_at, next_send_at, error_message, created_at FROM campaign_recipients";

/// Processing status of a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    /// Waiting for its current step.
    Pending,
    /// A send is in flight (or was in flight when the process stopped).
    Sending,
    /// The last attempted step was delivered to the transport.
    Sent,
    /// The last attempt failed; needs a manual requeue.
    Failed,
}

impl RecipientStatus {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parse a string into a recipient status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] if the string is unrecognized.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "recipient status",
                value: other.to_owned(),
            }),
        }
    }
}

/// One addressee of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Database row id (creation order).
    pub id: i64,
    /// Owning campaign.
    pub campaign_id: i64,
    /// Digits-only phone number.
    pub phone_number: String,
    /// Display name used for `{name}`.
    pub name: Option<String>,
    /// 0-based index of the next step to send.
    pub current_step: u32,
    /// Processing status.
    pub status: RecipientStatus,
    /// When the last successful send happened.
    pub last_sent_at: Option<String>,
    /// Earliest time the next step may be sent.
    pub next_send_at: Option<String>,
    /// Error of the last failed attempt.
    pub error_message: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

fn from_row(row: RecipientRow) -> Result<Recipient, StoreError> {
    let (
        id,
        campaign_id,
        phone_number,
        name,
        current_step,
        status,
        last_sent_at,
        next_send_at,
        error_message,
        created_at,
    ) = row;
    Ok(Recipient {
        id,
        campaign_id,
        phone_number,
        name,
        current_step: to_u32("current_step", current_step)?,
        status: RecipientStatus::parse(&status)?,
        last_sent_at,
        next_send_at,
        error_message,
        created_at,
    })
}

/// Recipient definition supplied when creating or updating a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecipient {
    /// Phone number (normalised to digits before insert).
    pub phone_number: String,
    /// Display name used for `{name}`.
    #[serde(default)]
    pub name: Option<String>,
}

/// Per-status recipient counts for one campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Recipients waiting for a step.
    pub pending: u64,
    /// Recipients with a send in flight.
    pub sending: u64,
    /// Recipients whose last step was sent.
    pub sent: u64,
    /// Recipients whose last attempt failed.
    pub failed: u64,
}

impl StatusCounts {
    /// Total number of recipients.
    pub fn total(&self) -> u64 {
        self.pending
            .saturating_add(self.sending)
            .saturating_add(self.sent)
            .saturating_add(self.failed)
    }
}

/// Insert recipients in order inside an open transaction.
pub(crate) async fn insert_many(
    tx: &mut Transaction<'_, Sqlite>,
    campaign_id: i64,
    recipients: &[NewRecipient],
) -> Result<(), StoreError> {
    for recipient in recipients {
        sqlx::query(
            "INSERT INTO campaign_recipients (campaign_id, phone_number, name) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(campaign_id)
        .bind(&recipient.phone_number)
        .bind(&recipient.name)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Replace the recipient set of a campaign inside an open transaction.
///
/// Existing rows whose phone number is still listed keep their progress (the
/// name is refreshed); rows not listed are removed with their logs; new phone
/// numbers are appended as `pending`.
pub(crate) async fn replace_set(
    tx: &mut Transaction<'_, Sqlite>,
    campaign_id: i64,
    recipients: &[NewRecipient],
) -> Result<(), StoreError> {
    let existing: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, phone_number FROM campaign_recipients WHERE campaign_id = ?1",
    )
    .bind(campaign_id)
    .fetch_all(&mut **tx)
    .await?;

    for (id, phone) in &existing {
        if recipients.iter().any(|r| &r.phone_number == phone) {
            continue;
        }
        sqlx::query("DELETE FROM send_logs WHERE recipient_id = ?1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM campaign_recipients WHERE id = ?1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }

    for recipient in recipients {
        sqlx::query(
            "INSERT INTO campaign_recipients (campaign_id, phone_number, name) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(campaign_id, phone_number) DO UPDATE SET name = excluded.name",
        )
        .bind(campaign_id)
        .bind(&recipient.phone_number)
        .bind(&recipient.name)
        .execute(&mut **tx)
        .await?;
    }
    trace!(campaign_id, count = recipients.len(), "recipient set replaced");
    Ok(())
}

/// Select the next batch of recipients to process, in creation order.
///
/// A recipient is eligible when it is `pending` or `sending`, or when it is
/// `sent` with steps left and its step delay gate (`next_send_at`) has passed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn eligible_batch(
    db: &SqlitePool,
    campaign_id: i64,
    step_count: u32,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<Recipient>, StoreError> {
    let rows: Vec<RecipientRow> = sqlx::query_as(&format!(
        "{RECIPIENT_COLUMNS} WHERE campaign_id = ?1 AND ( \
             status IN ('pending', 'sending') \
             OR (status = 'sent' AND current_step < ?2 \
                 AND (next_send_at IS NULL OR next_send_at <= ?3)) \
         ) ORDER BY id ASC LIMIT ?4"
    ))
    .bind(campaign_id)
    .bind(i64::from(step_count))
    .bind(format_timestamp(now))
    .bind(i64::from(limit))
    .fetch_all(db)
    .await?;
    rows.into_iter().map(from_row).collect()
}

/// Whether any recipient is eligible right now.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn has_eligible(
    db: &SqlitePool,
    campaign_id: i64,
    step_count: u32,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    Ok(!eligible_batch(db, campaign_id, step_count, now, 1)
        .await?
        .is_empty())
}

/// Number of recipients that still have work: `pending`, `sending`, or
/// `sent` with steps left (possibly waiting on a delay gate).
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn outstanding(
    db: &SqlitePool,
    campaign_id: i64,
    step_count: u32,
) -> Result<u64, StoreError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM campaign_recipients WHERE campaign_id = ?1 AND ( \
             status IN ('pending', 'sending') \
             OR (status = 'sent' AND current_step < ?2))",
    )
    .bind(campaign_id)
    .bind(i64::from(step_count))
    .fetch_one(db)
    .await?;
    Ok(count.cast_unsigned())
}

/// Mark a recipient as having a send in flight.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn mark_sending(db: &SqlitePool, recipient_id: i64) -> Result<(), StoreError> {
    sqlx::query("UPDATE campaign_recipients SET status = 'sending' WHERE id = ?1")
        .bind(recipient_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Outcome of one send attempt, recorded by [`record_attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The transport accepted the message.
    Sent {
        /// Hours until the following step becomes eligible, or `None` when the
        /// sent step was the last one.
        next_step_after_hours: Option<u32>,
    },
    /// The transport rejected the message.
    Failed {
        /// Error text, stored verbatim.
        error: String,
    },
}

/// Record the outcome of a send attempt and append its log row atomically.
///
/// On success `current_step` is incremented and `next_send_at` set; on failure
/// the recipient is marked `failed` with the error message.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure; nothing is written then.
pub async fn record_attempt(
    db: &SqlitePool,
    recipient: &Recipient,
    step_id: i64,
    outcome: &AttemptOutcome,
) -> Result<(), StoreError> {
    let mut tx = db.begin().await?;
    match outcome {
        AttemptOutcome::Sent {
            next_step_after_hours,
        } => {
            let gate = next_step_after_hours.map(|h| format!("+{h} hours"));
            sqlx::query(
                "UPDATE campaign_recipients SET status = 'sent', \
                     current_step = current_step + 1, \
                     last_sent_at = datetime('now'), \
                     next_send_at = CASE WHEN ?1 IS NULL THEN NULL \
                                    ELSE datetime('now', ?1) END, \
                     error_message = NULL \
                 WHERE id = ?2",
            )
            .bind(gate)
            .bind(recipient.id)
            .execute(&mut *tx)
            .await?;
            send_log::append(
                &mut tx,
                recipient.campaign_id,
                recipient.id,
                Some(step_id),
                LogStatus::Sent,
                None,
            )
            .await?;
        }
        AttemptOutcome::Failed { error } => {
            sqlx::query(
                "UPDATE campaign_recipients SET status = 'failed', error_message = ?1 \
                 WHERE id = ?2",
            )
            .bind(error)
            .bind(recipient.id)
            .execute(&mut *tx)
            .await?;
            send_log::append(
                &mut tx,
                recipient.campaign_id,
                recipient.id,
                Some(step_id),
                LogStatus::Failed,
                Some(error),
            )
            .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Move every `failed` recipient of a campaign back to `pending`.
///
/// Returns the number of recipients requeued.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn requeue_failed(db: &SqlitePool, campaign_id: i64) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE campaign_recipients SET status = 'pending', error_message = NULL \
         WHERE campaign_id = ?1 AND status = 'failed'",
    )
    .bind(campaign_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

/// Fetch one recipient.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn get(db: &SqlitePool, recipient_id: i64) -> Result<Option<Recipient>, StoreError> {
    let row: Option<RecipientRow> = sqlx::query_as(&format!("{RECIPIENT_COLUMNS} WHERE id = ?1"))
        .bind(recipient_id)
        .fetch_optional(db)
        .await?;
    row.map(from_row).transpose()
}

/// All recipients of a campaign in creation order.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn list(db: &SqlitePool, campaign_id: i64) -> Result<Vec<Recipient>, StoreError> {
    let rows: Vec<RecipientRow> = sqlx::query_as(&format!(
        "{RECIPIENT_COLUMNS} WHERE campaign_id = ?1 ORDER BY id ASC"
    ))
    .bind(campaign_id)
    .fetch_all(db)
    .await?;
    rows.into_iter().map(from_row).collect()
}

/// Per-status recipient counts.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn status_counts(db: &SqlitePool, campaign_id: i64) -> Result<StatusCounts, StoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, count(*) FROM campaign_recipients \
         WHERE campaign_id = ?1 GROUP BY status",
    )
    .bind(campaign_id)
    .fetch_all(db)
    .await?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        // count(*) is always non-negative.
        let count = count.cast_unsigned();
        match RecipientStatus::parse(&status)? {
            RecipientStatus::Pending => counts.pending = count,
            RecipientStatus::Sending => counts.sending = count,
            RecipientStatus::Sent => counts.sent = count,
            RecipientStatus::Failed => counts.failed = count,
        }
    }
    Ok(counts)
}
