//! Campaign supervisor: starts scheduled drafts and relaunches stalled
//! running campaigns.
//!
//! Runs as a background Tokio task, ticking at a configurable interval. A
//! running campaign whose loop exited (step delay pending, daily limit hit,
//! process restart) is picked up again once it has eligible recipients and
//! quota left.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::campaigns::{self, CampaignStatus};
use crate::store::recipients;

use super::{quota, CampaignDispatcher, DispatchError, LaunchOutcome};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Scheduled drafts that were started.
    pub started: Vec<i64>,
    /// Running campaigns whose loop was relaunched.
    pub relaunched: Vec<i64>,
}

/// Run the supervisor loop until the shutdown watch flips to `true` or closes.
pub async fn run_supervisor(
    dispatcher: CampaignDispatcher,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        interval_secs = interval.as_secs(),
        "campaign supervisor started"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tick(&dispatcher).await {
                    Ok(report) => {
                        if !report.started.is_empty() || !report.relaunched.is_empty() {
                            info!(
                                started = ?report.started,
                                relaunched = ?report.relaunched,
                                "supervisor tick"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "supervisor tick failed"),
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("campaign supervisor shutting down");
                    break;
                }
            }
        }
    }

    info!("campaign supervisor stopped");
}

/// Execute a single supervisor pass.
///
/// Failures to start an individual campaign are logged and do not stop the
/// pass.
///
/// # Errors
///
/// Returns an error if the campaign lists cannot be read.
pub async fn tick(dispatcher: &CampaignDispatcher) -> Result<TickReport, DispatchError> {
    let db = dispatcher.db();
    let now = Utc::now();
    let mut report = TickReport::default();

    for id in campaigns::due_drafts(db, now).await? {
        match dispatcher.start(id).await {
            Ok(_) => {
                info!(campaign_id = id, "scheduled campaign started");
                report.started.push(id);
            }
            Err(e) => warn!(campaign_id = id, error = %e, "scheduled start failed"),
        }
    }

    for id in campaigns::ids_with_status(db, CampaignStatus::Running).await? {
        if dispatcher.is_active(id).await {
            continue;
        }
        match needs_relaunch(dispatcher, id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(campaign_id = id, "running campaign has nothing to do yet");
                continue;
            }
            Err(e) => {
                warn!(campaign_id = id, error = %e, "could not evaluate campaign");
                continue;
            }
        }
        match dispatcher.start(id).await {
            Ok(LaunchOutcome::Launched) => report.relaunched.push(id),
            Ok(LaunchOutcome::AlreadyRunning) => {}
            Err(e) => warn!(campaign_id = id, error = %e, "relaunch failed"),
        }
    }

    Ok(report)
}

async fn needs_relaunch(dispatcher: &CampaignDispatcher, id: i64) -> Result<bool, DispatchError> {
    let db = dispatcher.db();
    let Some(campaign) = campaigns::get(db, id).await? else {
        return Ok(false);
    };
    let now = Utc::now();
    let step_count = u32::try_from(campaigns::steps(db, id).await?.len()).unwrap_or(u32::MAX);
    if !recipients::has_eligible(db, id, step_count, now).await? {
        // Nothing outstanding: a loop run marks the campaign completed.
        return Ok(recipients::outstanding(db, id, step_count).await? == 0);
    }
    let remaining =
        quota::remaining_today(db, id, campaign.daily_limit, &campaign.timezone, now).await?;
    Ok(remaining > 0)
}
