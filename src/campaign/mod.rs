//! Campaign API surface: validated create/update/delete plus control actions
//! delegated to the [`CampaignDispatcher`].

pub mod validate;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::dispatcher::{CampaignDispatcher, DispatchError, LaunchOutcome};
use crate::store::campaigns::{self, Campaign, CampaignStatus, CampaignUpdate, NewCampaign};
use crate::store::recipients::{self, StatusCounts};
use crate::store::send_log::{self, LogStatus};
use crate::store::StoreError;

/// Errors from campaign operations.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A control action failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// No campaign with this id.
    #[error("campaign {0} not found")]
    NotFound(i64),

    /// The definition is invalid.
    #[error("invalid campaign: {0}")]
    Invalid(String),

    /// The campaign is running and cannot be edited.
    #[error("campaign {0} is running; pause it before editing")]
    Running(i64),
}

/// Control actions accepted by [`CampaignService::set_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Start a draft or paused campaign.
    Start,
    /// Pause a running campaign.
    Pause,
    /// Resume a paused campaign.
    Resume,
}

impl Action {
    /// Returns the wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }

    /// Parse an action name.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::Invalid`] for unknown names.
    pub fn parse(s: &str) -> Result<Self, CampaignError> {
        match s {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            other => Err(CampaignError::Invalid(format!("unknown action {other:?}"))),
        }
    }
}

/// Campaign with its progress counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignProgress {
    /// The campaign row.
    pub campaign: Campaign,
    /// Number of steps.
    pub step_count: u32,
    /// Recipients per status.
    pub recipients: StatusCounts,
    /// Successful sends logged.
    pub sent_logs: u64,
    /// Failed sends logged.
    pub failed_logs: u64,
    /// Whether a processing loop is live in this process.
    pub active: bool,
}

/// Campaign operations.
#[derive(Debug, Clone)]
pub struct CampaignService {
    db: SqlitePool,
    dispatcher: CampaignDispatcher,
}

impl CampaignService {
    /// Create the service over a store and dispatcher.
    pub fn new(db: SqlitePool, dispatcher: CampaignDispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Validate and insert a campaign in `draft`. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::Invalid`] for a bad definition or a store error.
    pub async fn create(&self, mut campaign: NewCampaign) -> Result<i64, CampaignError> {
        validate::new_campaign(&mut campaign)?;
        let id = campaigns::insert(&self.db, &campaign).await?;
        info!(
            campaign_id = id,
            name = %campaign.name,
            instance = %campaign.instance_id,
            steps = campaign.steps.len(),
            recipients = campaign.recipients.len(),
            "campaign created"
        );
        Ok(id)
    }

    /// Apply a partial update. Steps and recipients are replaced wholesale
    /// when provided; recipients that stay keep their progress.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::Running`] while the campaign runs,
    /// [`CampaignError::Invalid`] for a bad merged definition, or
    /// [`CampaignError::NotFound`].
    pub async fn update(
        &self,
        campaign_id: i64,
        mut update: CampaignUpdate,
    ) -> Result<(), CampaignError> {
        let current = self.require(campaign_id).await?;
        if current.status == CampaignStatus::Running {
            return Err(CampaignError::Running(campaign_id));
        }

        if update.clear_schedule && update.scheduled_at.is_some() {
            return Err(CampaignError::Invalid(
                "scheduled_at and clear_schedule are mutually exclusive".to_owned(),
            ));
        }
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(CampaignError::Invalid("name must not be empty".to_owned()));
        }
        validate::delays(
            update.min_delay_ms.unwrap_or(current.min_delay_ms),
            update.max_delay_ms.unwrap_or(current.max_delay_ms),
        )?;
        validate::daily_limit(update.daily_limit.unwrap_or(current.daily_limit))?;
        if let Some(ref tz) = update.timezone {
            validate::timezone(tz)?;
        }
        if let Some(ref steps) = update.steps {
            validate::steps(steps)?;
        }
        if let Some(ref mut list) = update.recipients {
            validate::recipients(list)?;
        }

        campaigns::update(&self.db, campaign_id, &update).await?;
        info!(campaign_id, "campaign updated");

        let reshaped = update.steps.is_some() || update.recipients.is_some();
        if reshaped && current.status == CampaignStatus::Completed {
            self.reopen_if_outstanding(campaign_id).await?;
        }
        Ok(())
    }

    /// Move a `completed` campaign back to `paused` when it has work again.
    async fn reopen_if_outstanding(&self, campaign_id: i64) -> Result<(), CampaignError> {
        let step_count = u32::try_from(campaigns::steps(&self.db, campaign_id).await?.len())
            .unwrap_or(u32::MAX);
        if recipients::outstanding(&self.db, campaign_id, step_count).await? == 0 {
            return Ok(());
        }
        if campaigns::transition(
            &self.db,
            campaign_id,
            &[CampaignStatus::Completed],
            CampaignStatus::Paused,
        )
        .await?
        {
            info!(campaign_id, "completed campaign reopened as paused");
        }
        Ok(())
    }

    /// Apply a control action.
    ///
    /// # Errors
    ///
    /// Propagates the dispatcher's error.
    pub async fn set_action(
        &self,
        campaign_id: i64,
        action: Action,
    ) -> Result<Option<LaunchOutcome>, CampaignError> {
        let outcome = match action {
            Action::Start => Some(self.dispatcher.start(campaign_id).await?),
            Action::Resume => Some(self.dispatcher.resume(campaign_id).await?),
            Action::Pause => {
                self.dispatcher.pause(campaign_id).await?;
                None
            }
        };
        Ok(outcome)
    }

    /// Record a control action in the store without running a loop here.
    ///
    /// For one-shot callers such as the CLI: a running daemon's supervisor
    /// launches the loop on its next tick.
    ///
    /// # Errors
    ///
    /// Propagates the dispatcher's error.
    pub async fn request_action(
        &self,
        campaign_id: i64,
        action: Action,
    ) -> Result<(), CampaignError> {
        match action {
            Action::Start => self.dispatcher.activate(campaign_id, false).await?,
            Action::Resume => self.dispatcher.activate(campaign_id, true).await?,
            Action::Pause => self.dispatcher.pause(campaign_id).await?,
        }
        info!(campaign_id, action = action.as_str(), "campaign action recorded");
        Ok(())
    }

    /// Stop any live loop, then delete the campaign and everything under it.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::NotFound`] for an unknown id.
    pub async fn delete(&self, campaign_id: i64) -> Result<(), CampaignError> {
        self.dispatcher.cancel(campaign_id).await;
        self.dispatcher.wait(campaign_id).await;
        if !campaigns::delete(&self.db, campaign_id).await? {
            return Err(CampaignError::NotFound(campaign_id));
        }
        info!(campaign_id, "campaign deleted");
        Ok(())
    }

    /// Fetch a campaign.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::NotFound`] for an unknown id.
    pub async fn get(&self, campaign_id: i64) -> Result<Campaign, CampaignError> {
        self.require(campaign_id).await
    }

    /// All campaigns, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn list(&self) -> Result<Vec<Campaign>, CampaignError> {
        Ok(campaigns::list(&self.db).await?)
    }

    /// Campaign with recipient and log counters.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::NotFound`] for an unknown id.
    pub async fn progress(&self, campaign_id: i64) -> Result<CampaignProgress, CampaignError> {
        let campaign = self.require(campaign_id).await?;
        let step_count = u32::try_from(campaigns::steps(&self.db, campaign_id).await?.len())
            .unwrap_or(u32::MAX);
        Ok(CampaignProgress {
            campaign,
            step_count,
            recipients: recipients::status_counts(&self.db, campaign_id).await?,
            sent_logs: send_log::count(&self.db, campaign_id, LogStatus::Sent).await?,
            failed_logs: send_log::count(&self.db, campaign_id, LogStatus::Failed).await?,
            active: self.dispatcher.is_active(campaign_id).await,
        })
    }

    /// Move failed recipients back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`CampaignError::NotFound`] for an unknown id.
    pub async fn requeue_failed(&self, campaign_id: i64) -> Result<u64, CampaignError> {
        match self.dispatcher.requeue_failed(campaign_id).await {
            Err(DispatchError::NotFound(id)) => Err(CampaignError::NotFound(id)),
            other => Ok(other?),
        }
    }

    async fn require(&self, campaign_id: i64) -> Result<Campaign, CampaignError> {
        campaigns::get(&self.db, campaign_id)
            .await?
            .ok_or(CampaignError::NotFound(campaign_id))
    }
}
