//! One campaign's sequential processing loop.
//!
//! The loop sends at most one message at a time. Before every recipient it
//! checks the cancellation token and re-reads the campaign status, so pause and
//! delete take effect at the next recipient boundary. The in-flight send and
//! the inter-send delay are never interrupted.
//!
//! The tenant's session is looked up again for every recipient, so a restart
//! or reconnect in the middle of a run only costs a short wait.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionError, ConnectionManager, ConnectionStatus, SessionHandle};
use crate::store::campaigns::{self, CampaignStatus, Step};
use crate::store::recipients::{self, AttemptOutcome, Recipient};
use crate::transport::TransportError;

use super::{jitter, quota, render, DispatchError};

/// Failure reason recorded for campaigns without steps.
pub const NO_STEPS_REASON: &str = "campaign has no steps";

/// How long a run waits for a session that is still (re)connecting.
const CONNECT_GRACE: Duration = Duration::from_secs(10);

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Every recipient finished every step.
    Completed,
    /// Nothing is eligible right now, but step delays are still pending.
    Waiting,
    /// The daily quota is used up.
    QuotaReached,
    /// Paused, cancelled, or deleted.
    Stopped,
    /// The campaign was not running when the loop started.
    NotRunning,
    /// The campaign had no steps and was marked failed.
    Failed,
}

/// What a run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Successful sends.
    pub sent: u32,
    /// Failed sends.
    pub failed: u32,
    /// Why the run ended.
    pub end: RunEnd,
}

pub(crate) struct CampaignLoop {
    pub db: SqlitePool,
    pub connections: Arc<ConnectionManager>,
    pub campaign_id: i64,
    pub token: CancellationToken,
}

impl CampaignLoop {
    pub(crate) async fn run(self) -> Result<RunSummary, DispatchError> {
        let id = self.campaign_id;
        let mut summary = RunSummary {
            sent: 0,
            failed: 0,
            end: RunEnd::NotRunning,
        };

        let Some(campaign) = campaigns::get(&self.db, id).await? else {
            summary.end = RunEnd::Stopped;
            return Ok(summary);
        };
        if campaign.status != CampaignStatus::Running {
            return Ok(summary);
        }

        let steps = campaigns::steps(&self.db, id).await?;
        if steps.is_empty() {
            campaigns::mark_failed(&self.db, id, NO_STEPS_REASON).await?;
            warn!(campaign_id = id, "campaign has no steps, marked failed");
            summary.end = RunEnd::Failed;
            return Ok(summary);
        }
        let step_count = u32::try_from(steps.len()).unwrap_or(u32::MAX);

        info!(
            campaign_id = id,
            instance = %campaign.instance_id,
            steps = step_count,
            "campaign run started"
        );

        let mut first = true;
        summary.end = 'batches: loop {
            let remaining = quota::remaining_today(
                &self.db,
                id,
                campaign.daily_limit,
                &campaign.timezone,
                Utc::now(),
            )
            .await?;
            if remaining == 0 {
                info!(campaign_id = id, daily_limit = campaign.daily_limit, "daily limit reached");
                break RunEnd::QuotaReached;
            }

            let batch =
                recipients::eligible_batch(&self.db, id, step_count, Utc::now(), remaining).await?;
            if batch.is_empty() {
                break self.finish(step_count).await?;
            }
            debug!(campaign_id = id, size = batch.len(), remaining, "processing batch");

            for recipient in batch {
                if !self.still_running().await? {
                    break 'batches RunEnd::Stopped;
                }
                if !first {
                    tokio::time::sleep(jitter::draw_delay(
                        campaign.min_delay_ms,
                        campaign.max_delay_ms,
                    ))
                    .await;
                    if !self.still_running().await? {
                        break 'batches RunEnd::Stopped;
                    }
                }
                first = false;

                if self.attempt(&recipient, &steps, &campaign.instance_id).await? {
                    summary.sent = summary.sent.saturating_add(1);
                } else {
                    summary.failed = summary.failed.saturating_add(1);
                }
            }
        };

        info!(
            campaign_id = id,
            sent = summary.sent,
            failed = summary.failed,
            end = ?summary.end,
            "campaign run ended"
        );
        Ok(summary)
    }

    /// Cancellation and status check at the loop boundary.
    async fn still_running(&self) -> Result<bool, DispatchError> {
        if self.token.is_cancelled() {
            debug!(campaign_id = self.campaign_id, "campaign loop cancelled");
            return Ok(false);
        }
        let status = campaigns::status(&self.db, self.campaign_id).await?;
        Ok(status == Some(CampaignStatus::Running))
    }

    /// Send the recipient's current step. Returns whether the send succeeded.
    async fn attempt(
        &self,
        recipient: &Recipient,
        steps: &[Step],
        instance_id: &str,
    ) -> Result<bool, DispatchError> {
        recipients::mark_sending(&self.db, recipient.id).await?;

        let last = steps.len().saturating_sub(1);
        let index = usize::try_from(recipient.current_step)
            .unwrap_or(usize::MAX)
            .min(last);
        let Some(step) = steps.get(index) else {
            return Ok(false);
        };
        let message = render::build_message(step, recipient);

        let result = match self.session(instance_id).await {
            Ok(handle) => handle
                .send(&recipient.phone_number, &message)
                .await
                .map_err(failure_text),
            Err(e) => Err(failure_text(e)),
        };

        let outcome = match result {
            Ok(()) => AttemptOutcome::Sent {
                next_step_after_hours: (index < last).then_some(step.delay_after_hours),
            },
            Err(error) => AttemptOutcome::Failed { error },
        };
        recipients::record_attempt(&self.db, recipient, step.id, &outcome).await?;

        match &outcome {
            AttemptOutcome::Sent { .. } => {
                debug!(
                    campaign_id = self.campaign_id,
                    recipient_id = recipient.id,
                    step = step.step_order,
                    "step sent"
                );
                Ok(true)
            }
            AttemptOutcome::Failed { error } => {
                warn!(
                    campaign_id = self.campaign_id,
                    recipient_id = recipient.id,
                    step = step.step_order,
                    error = %error,
                    "send failed"
                );
                Ok(false)
            }
        }
    }

    /// Current session of the campaign's tenant, given a moment to settle if
    /// it is still (re)connecting.
    async fn session(&self, instance_id: &str) -> Result<SessionHandle, ConnectionError> {
        let handle = self.connections.get_or_create(instance_id).await?;
        if is_settling(handle.status()) {
            if let Err(e) = handle.wait_for(CONNECT_GRACE, |s| !is_settling(s)).await {
                debug!(
                    campaign_id = self.campaign_id,
                    instance = instance_id,
                    error = %e,
                    "session still not connected"
                );
            }
        }
        Ok(handle)
    }

    /// Complete the campaign when no recipient has work left.
    async fn finish(&self, step_count: u32) -> Result<RunEnd, DispatchError> {
        if recipients::outstanding(&self.db, self.campaign_id, step_count).await? > 0 {
            return Ok(RunEnd::Waiting);
        }
        if campaigns::transition(
            &self.db,
            self.campaign_id,
            &[CampaignStatus::Running],
            CampaignStatus::Completed,
        )
        .await?
        {
            info!(campaign_id = self.campaign_id, "campaign completed");
            Ok(RunEnd::Completed)
        } else {
            Ok(RunEnd::Stopped)
        }
    }
}

/// Statuses a resuming session passes through on its own.
fn is_settling(status: ConnectionStatus) -> bool {
    matches!(
        status,
        ConnectionStatus::Uninitialized
            | ConnectionStatus::Connecting
            | ConnectionStatus::Disconnected
            | ConnectionStatus::Reconnecting
    )
}

/// Error text stored on the recipient and its log row. Rejections keep the
/// remote side's message as-is.
fn failure_text(error: ConnectionError) -> String {
    match error {
        ConnectionError::Transport(TransportError::Rejected(message)) => message,
        other => other.to_string(),
    }
}
