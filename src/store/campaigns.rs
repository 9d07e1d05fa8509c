//! Campaign and step rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, trace};

use super::recipients::{self, NewRecipient};
use super::{format_timestamp, to_u32, to_u64, StoreError};

/// Row type returned by SQLite queries for campaigns.
type CampaignRow = (
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    String,
    i64,
    i64,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

/// Row type returned by SQLite queries for steps.
type StepRow = (
    i64,
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
);

const CAMPAIGN_COLUMNS: &str = "SELECT id, name, description, owner_id, instance_id, status, \
     scheduled_at, timezone, min_delay_ms, max_delay_ms, daily_limit, failure_reason, \
     started_at, completed_at, created_at, updated_at FROM campaigns";

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created, never started.
    Draft,
    /// A processing loop may send.
    Running,
    /// Stopped by the operator; resumable.
    Paused,
    /// Every recipient went through every step (or failed).
    Completed,
    /// Rejected at start (e.g. no steps).
    Failed,
}

impl CampaignStatus {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a string into a campaign status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] if the string is unrecognized.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "draft" => Ok(Self::Draft),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "campaign status",
                value: other.to_owned(),
            }),
        }
    }

    /// Check if transitioning to `target` is valid.
    pub fn can_transition_to(&self, target: CampaignStatus) -> bool {
        matches!(
            (self, target),
            (Self::Draft, CampaignStatus::Running)
                | (Self::Draft, CampaignStatus::Failed)
                | (Self::Paused, CampaignStatus::Running)
                | (Self::Running, CampaignStatus::Paused)
                | (Self::Running, CampaignStatus::Completed)
                | (Self::Running, CampaignStatus::Failed)
                | (Self::Completed, CampaignStatus::Paused)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of message a step sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text.
    Text,
    /// Image with optional caption.
    Image,
    /// Document with file name and optional caption.
    Document,
}

impl MessageType {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
        }
    }

    /// Parse a string into a message type.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] if the string is unrecognized.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "document" => Ok(Self::Document),
            other => Err(StoreError::InvalidEnum {
                field: "message type",
                value: other.to_owned(),
            }),
        }
    }

    /// Whether this type carries a media attachment.
    pub fn has_media(&self) -> bool {
        matches!(self, Self::Image | Self::Document)
    }
}

/// A broadcast campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    /// Database row id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Staff member who owns the campaign.
    pub owner_id: Option<String>,
    /// Connection (tenant) the campaign sends from.
    pub instance_id: String,
    /// Current lifecycle status.
    pub status: CampaignStatus,
    /// When the supervisor should start a draft campaign.
    pub scheduled_at: Option<String>,
    /// IANA timezone used for the daily quota boundary.
    pub timezone: String,
    /// Lower bound of the inter-send delay.
    pub min_delay_ms: u64,
    /// Upper bound of the inter-send delay.
    pub max_delay_ms: u64,
    /// Maximum successful sends per local day.
    pub daily_limit: u32,
    /// Why the campaign was marked failed.
    pub failure_reason: Option<String>,
    /// First time the campaign entered `running`.
    pub started_at: Option<String>,
    /// When the campaign entered `completed`.
    pub completed_at: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

fn campaign_from_row(row: CampaignRow) -> Result<Campaign, StoreError> {
    let (
        id,
        name,
        description,
        owner_id,
        instance_id,
        status,
        scheduled_at,
        timezone,
        min_delay_ms,
        max_delay_ms,
        daily_limit,
        failure_reason,
        started_at,
        completed_at,
        created_at,
        updated_at,
    ) = row;
    Ok(Campaign {
        id,
        name,
        description,
        owner_id,
        instance_id,
        status: CampaignStatus::parse(&status)?,
        scheduled_at,
        timezone,
        min_delay_ms: to_u64("min_delay_ms", min_delay_ms)?,
        max_delay_ms: to_u64("max_delay_ms", max_delay_ms)?,
        daily_limit: to_u32("daily_limit", daily_limit)?,
        failure_reason,
        started_at,
        completed_at,
        created_at,
        updated_at,
    })
}

/// One message template in a campaign's sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Database row id.
    pub id: i64,
    /// Owning campaign.
    pub campaign_id: i64,
    /// 1-based position in the sequence.
    pub step_order: u32,
    /// Kind of message.
    pub message_type: MessageType,
    /// Template with `{name}` / `{phone}` placeholders (caption for media).
    pub message_text: String,
    /// Media location for image and document steps.
    pub media_url: Option<String>,
    /// File name shown for document steps.
    pub file_name: Option<String>,
    /// Hours to wait after this step before the next one is eligible.
    pub delay_after_hours: u32,
}

fn step_from_row(row: StepRow) -> Result<Step, StoreError> {
    let (id, campaign_id, step_order, message_type, message_text, media_url, file_name, delay) =
        row;
    Ok(Step {
        id,
        campaign_id,
        step_order: to_u32("step_order", step_order)?,
        message_type: MessageType::parse(&message_type)?,
        message_text,
        media_url,
        file_name,
        delay_after_hours: to_u32("delay_after_hours", delay)?,
    })
}

/// Step definition supplied when creating or replacing a campaign's steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStep {
    /// 1-based position in the sequence.
    pub step_order: u32,
    /// Kind of message.
    pub message_type: MessageType,
    /// Template text (caption for media steps).
    #[serde(default)]
    pub message_text: String,
    /// Media location for image and document steps.
    #[serde(default)]
    pub media_url: Option<String>,
    /// File name for document steps.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Hours to wait after this step before the next one is eligible.
    #[serde(default)]
    pub delay_after_hours: u32,
}

/// Campaign definition accepted by [`insert`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCampaign {
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Staff member who owns the campaign.
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Connection (tenant) the campaign sends from.
    pub instance_id: String,
    /// When the supervisor should start the campaign automatically.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// IANA timezone for the daily quota boundary.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Lower bound of the inter-send delay.
    pub min_delay_ms: u64,
    /// Upper bound of the inter-send delay.
    pub max_delay_ms: u64,
    /// Maximum successful sends per local day.
    pub daily_limit: u32,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<NewStep>,
    /// Recipients in send order.
    #[serde(default)]
    pub recipients: Vec<NewRecipient>,
}

fn default_timezone() -> String {
    "UTC".to_owned()
}

/// Partial update of a campaign. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignUpdate {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
    /// New scheduled start.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Drop the scheduled start. Cannot be combined with `scheduled_at`.
    #[serde(default)]
    pub clear_schedule: bool,
    /// New timezone.
    #[serde(default)]
    pub timezone: Option<String>,
    /// New lower delay bound.
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    /// New upper delay bound.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// New daily limit.
    #[serde(default)]
    pub daily_limit: Option<u32>,
    /// Replacement step list.
    #[serde(default)]
    pub steps: Option<Vec<NewStep>>,
    /// Replacement recipient list.
    #[serde(default)]
    pub recipients: Option<Vec<NewRecipient>>,
}

fn ms_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Insert a campaign with its steps and recipients in one transaction.
///
/// The campaign starts in `draft`. Returns the new campaign id.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure (including uniqueness
/// violations on step order or recipient phone).
pub async fn insert(db: &SqlitePool, campaign: &NewCampaign) -> Result<i64, StoreError> {
    let mut tx = db.begin().await?;

    let result = sqlx::query(
        "INSERT INTO campaigns (name, description, owner_id, instance_id, status, \
         scheduled_at, timezone, min_delay_ms, max_delay_ms, daily_limit) \
         VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(&campaign.name)
    .bind(&campaign.description)
    .bind(&campaign.owner_id)
    .bind(&campaign.instance_id)
    .bind(campaign.scheduled_at.map(format_timestamp))
    .bind(&campaign.timezone)
    .bind(ms_to_i64(campaign.min_delay_ms))
    .bind(ms_to_i64(campaign.max_delay_ms))
    .bind(i64::from(campaign.daily_limit))
    .execute(&mut *tx)
    .await?;
    let id = result.last_insert_rowid();

    insert_steps(&mut tx, id, &campaign.steps).await?;
    recipients::insert_many(&mut tx, id, &campaign.recipients).await?;

    tx.commit().await?;
    debug!(
        campaign_id = id,
        steps = campaign.steps.len(),
        recipients = campaign.recipients.len(),
        "campaign created"
    );
    Ok(id)
}

async fn insert_steps(
    tx: &mut Transaction<'_, Sqlite>,
    campaign_id: i64,
    steps: &[NewStep],
) -> Result<(), StoreError> {
    for step in steps {
        sqlx::query(
            "INSERT INTO campaign_steps (campaign_id, step_order, message_type, message_text, \
             media_url, file_name, delay_after_hours) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(campaign_id)
        .bind(i64::from(step.step_order))
        .bind(step.message_type.as_str())
        .bind(&step.message_text)
        .bind(&step.media_url)
        .bind(&step.file_name)
        .bind(i64::from(step.delay_after_hours))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Apply a partial update in one transaction.
///
/// Steps are replaced wholesale. Recipients are replaced as a set: rows whose
/// phone number appears in the new list keep their progress, the rest are
/// removed, and new phone numbers are appended as `pending`.
///
/// # Errors
///
/// Returns [`StoreError::CampaignNotFound`] if the campaign does not exist,
/// or [`StoreError::Database`] on SQLite failure.
pub async fn update(
    db: &SqlitePool,
    campaign_id: i64,
    update: &CampaignUpdate,
) -> Result<(), StoreError> {
    let mut tx = db.begin().await?;

    let result = sqlx::query(
        "UPDATE campaigns SET \
             name = COALESCE(?1, name), \
             description = COALESCE(?2, description), \
             scheduled_at = CASE WHEN ?9 THEN NULL ELSE COALESCE(?3, scheduled_at) END, \
             timezone = COALESCE(?4, timezone), \
             min_delay_ms = COALESCE(?5, min_delay_ms), \
             max_delay_ms = COALESCE(?6, max_delay_ms), \
             daily_limit = COALESCE(?7, daily_limit), \
             updated_at = datetime('now') \
         WHERE id = ?8",
    )
    .bind(&update.name)
    .bind(&update.description)
    .bind(update.scheduled_at.map(format_timestamp))
    .bind(&update.timezone)
    .bind(update.min_delay_ms.map(ms_to_i64))
    .bind(update.max_delay_ms.map(ms_to_i64))
    .bind(update.daily_limit.map(i64::from))
    .bind(campaign_id)
    .bind(update.clear_schedule)
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::CampaignNotFound(campaign_id));
    }

    if let Some(ref steps) = update.steps {
        sqlx::query("DELETE FROM campaign_steps WHERE campaign_id = ?1")
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
        insert_steps(&mut tx, campaign_id, steps).await?;
    }

    if let Some(ref new_recipients) = update.recipients {
        recipients::replace_set(&mut tx, campaign_id, new_recipients).await?;
    }

    tx.commit().await?;
    trace!(campaign_id, "campaign updated");
    Ok(())
}

/// Fetch a campaign.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn get(db: &SqlitePool, campaign_id: i64) -> Result<Option<Campaign>, StoreError> {
    let row: Option<CampaignRow> = sqlx::query_as(&format!("{CAMPAIGN_COLUMNS} WHERE id = ?1"))
        .bind(campaign_id)
        .fetch_optional(db)
        .await?;
    row.map(campaign_from_row).transpose()
}

/// Fetch a campaign, failing if it does not exist.
///
/// # Errors
///
/// Returns [`StoreError::CampaignNotFound`] when missing.
pub async fn require(db: &SqlitePool, campaign_id: i64) -> Result<Campaign, StoreError> {
    get(db, campaign_id)
        .await?
        .ok_or(StoreError::CampaignNotFound(campaign_id))
}

/// List every campaign, newest first.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn list(db: &SqlitePool) -> Result<Vec<Campaign>, StoreError> {
    let rows: Vec<CampaignRow> =
        sqlx::query_as(&format!("{CAMPAIGN_COLUMNS} ORDER BY id DESC"))
            .fetch_all(db)
            .await?;
    rows.into_iter().map(campaign_from_row).collect()
}

/// Ids of campaigns in the given status, oldest first.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn ids_with_status(
    db: &SqlitePool,
    status: CampaignStatus,
) -> Result<Vec<i64>, StoreError> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT id FROM campaigns WHERE status = ?1 ORDER BY id ASC")
            .bind(status.as_str())
            .fetch_all(db)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Ids of draft campaigns whose `scheduled_at` is at or before `now`.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn due_drafts(db: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM campaigns \
         WHERE status = 'draft' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1 \
         ORDER BY scheduled_at ASC, id ASC",
    )
    .bind(format_timestamp(now))
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Read only the status column.
///
/// Returns `None` if the campaign was deleted.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn status(
    db: &SqlitePool,
    campaign_id: i64,
) -> Result<Option<CampaignStatus>, StoreError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM campaigns WHERE id = ?1")
        .bind(campaign_id)
        .fetch_optional(db)
        .await?;
    row.map(|(s,)| CampaignStatus::parse(&s)).transpose()
}

/// Atomically move a campaign from any of `from` to `to`.
///
/// Returns `true` if this call performed the transition. Entering `running`
/// stamps `started_at` the first time; entering `completed` stamps
/// `completed_at`; leaving `failed` is not possible through this function.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn transition(
    db: &SqlitePool,
    campaign_id: i64,
    from: &[CampaignStatus],
    to: CampaignStatus,
) -> Result<bool, StoreError> {
    if from.is_empty() {
        return Ok(false);
    }
    // Status names are static identifiers, never user input.
    let from_list = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE campaigns SET status = ?1, \
             started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, datetime('now')) \
                          ELSE started_at END, \
             completed_at = CASE WHEN ?1 = 'completed' THEN datetime('now') \
                            WHEN ?1 = 'running' THEN NULL ELSE completed_at END, \
             updated_at = datetime('now') \
         WHERE id = ?2 AND status IN ({from_list})"
    );
    let result = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(campaign_id)
        .execute(db)
        .await?;
    let moved = result.rows_affected() > 0;
    if moved {
        debug!(campaign_id, to = to.as_str(), "campaign status changed");
    }
    Ok(moved)
}

/// Mark a campaign as failed with a reason.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn mark_failed(
    db: &SqlitePool,
    campaign_id: i64,
    reason: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE campaigns SET status = 'failed', failure_reason = ?1, \
             updated_at = datetime('now') \
         WHERE id = ?2",
    )
    .bind(reason)
    .bind(campaign_id)
    .execute(db)
    .await?;
    debug!(campaign_id, reason, "campaign marked failed");
    Ok(())
}

/// Delete a campaign with its steps, recipients, and logs.
///
/// Returns `true` if a row was removed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn delete(db: &SqlitePool, campaign_id: i64) -> Result<bool, StoreError> {
    let mut tx = db.begin().await?;
    // Explicit deletes keep this correct even if foreign keys are disabled.
    for table in ["send_logs", "campaign_recipients", "campaign_steps"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE campaign_id = ?1"))
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
    }
    let result = sqlx::query("DELETE FROM campaigns WHERE id = ?1")
        .bind(campaign_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

/// Ordered steps of a campaign.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn steps(db: &SqlitePool, campaign_id: i64) -> Result<Vec<Step>, StoreError> {
    let rows: Vec<StepRow> = sqlx::query_as(
        "SELECT id, campaign_id, step_order, message_type, message_text, media_url, \
         file_name, delay_after_hours \
         FROM campaign_steps WHERE campaign_id = ?1 ORDER BY step_order ASC",
    )
    .bind(campaign_id)
    .fetch_all(db)
    .await?;
    rows.into_iter().map(step_from_row).collect()
}
