//! Campaign dispatcher: status-gated, single-flight processing loops.
//!
//! Each running campaign gets at most one loop per process. Control operations
//! (`start`, `pause`, `resume`, `cancel`) are idempotent. Status changes go
//! through conditional UPDATEs, so two callers racing to start a campaign
//! cannot both win; the loop map lock makes the launch itself single-flight.

mod jitter;
mod quota;
pub mod render;
mod run;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::store::campaigns::{self, CampaignStatus};
use crate::store::recipients;
use crate::store::StoreError;

pub use jitter::draw_delay;
pub use quota::{local_midnight, remaining_today, resolve_timezone};
pub use run::{RunEnd, RunSummary, NO_STEPS_REASON};

use run::CampaignLoop;

/// Errors from dispatcher control operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No campaign with this id.
    #[error("campaign {0} not found")]
    NotFound(i64),

    /// The campaign has no steps; it was marked failed.
    #[error("campaign {0} has no steps")]
    NoSteps(i64),

    /// The action is not allowed in the campaign's current status.
    #[error("cannot {action} campaign {campaign_id} in status {status}")]
    InvalidState {
        /// Campaign id.
        campaign_id: i64,
        /// Attempted action.
        action: &'static str,
        /// Status at the time of the call.
        status: CampaignStatus,
    },
}

/// Result of a `start` / `resume` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A new processing loop was spawned.
    Launched,
    /// A loop for this campaign is already live in this process.
    AlreadyRunning,
}

struct LoopEntry {
    token: CancellationToken,
    generation: u64,
    finished: watch::Receiver<bool>,
}

struct Inner {
    db: SqlitePool,
    connections: Arc<ConnectionManager>,
    loops: Mutex<HashMap<i64, LoopEntry>>,
    generation: AtomicU64,
}

/// Drives running campaigns. Cheap to clone.
#[derive(Clone)]
pub struct CampaignDispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CampaignDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignDispatcher").finish_non_exhaustive()
    }
}

impl CampaignDispatcher {
    /// Create a dispatcher with no live loops.
    pub fn new(db: SqlitePool, connections: Arc<ConnectionManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                connections,
                loops: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Database pool shared with the loops.
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Move a `draft` or `paused` campaign to `running` and launch its loop.
    ///
    /// Calling `start` on a `running` campaign is a no-op when its loop is
    /// live, and relaunches the loop otherwise (e.g. after a restart).
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] for an unknown id.
    /// - [`DispatchError::NoSteps`] when the campaign has no steps; it is
    ///   marked failed.
    /// - [`DispatchError::InvalidState`] for `completed` or `failed`
    ///   campaigns.
    pub async fn start(&self, campaign_id: i64) -> Result<LaunchOutcome, DispatchError> {
        self.launch(campaign_id, "start", &[CampaignStatus::Draft, CampaignStatus::Paused])
            .await
    }

    /// Resume a `paused` campaign. Idempotent on `running` campaigns.
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start); `draft` campaigns must be started instead.
    pub async fn resume(&self, campaign_id: i64) -> Result<LaunchOutcome, DispatchError> {
        self.launch(campaign_id, "resume", &[CampaignStatus::Paused])
            .await
    }

    /// Move a campaign to `running` without launching a loop in this process.
    ///
    /// Used by one-shot callers; a daemon's supervisor picks the campaign up
    /// on its next tick.
    ///
    /// # Errors
    ///
    /// As [`start`](Self::start) (or [`resume`](Self::resume) when `resume` is set).
    pub async fn activate(&self, campaign_id: i64, resume: bool) -> Result<(), DispatchError> {
        let loops = self.inner.loops.lock().await;
        if resume {
            self.gate(&loops, campaign_id, "resume", &[CampaignStatus::Paused])
                .await?;
        } else {
            self.gate(
                &loops,
                campaign_id,
                "start",
                &[CampaignStatus::Draft, CampaignStatus::Paused],
            )
            .await?;
        }
        Ok(())
    }

    /// Status gate shared by every start path. Returns `true` when the
    /// campaign is running and needs a loop in this process.
    async fn gate(
        &self,
        loops: &HashMap<i64, LoopEntry>,
        campaign_id: i64,
        action: &'static str,
        startable: &[CampaignStatus],
    ) -> Result<bool, DispatchError> {
        let db = &self.inner.db;
        let status = campaigns::status(db, campaign_id)
            .await?
            .ok_or(DispatchError::NotFound(campaign_id))?;

        if status == CampaignStatus::Running {
            return Ok(!loops.contains_key(&campaign_id));
        }
        if !startable.contains(&status) {
            return Err(DispatchError::InvalidState {
                campaign_id,
                action,
                status,
            });
        }
        if campaigns::steps(db, campaign_id).await?.is_empty() {
            campaigns::mark_failed(db, campaign_id, NO_STEPS_REASON).await?;
            warn!(campaign_id, "rejected start of campaign without steps");
            return Err(DispatchError::NoSteps(campaign_id));
        }
        if campaigns::transition(db, campaign_id, startable, CampaignStatus::Running).await? {
            return Ok(!loops.contains_key(&campaign_id));
        }
        // Status changed underneath us; judge what it is now.
        let now = campaigns::status(db, campaign_id)
            .await?
            .ok_or(DispatchError::NotFound(campaign_id))?;
        if now == CampaignStatus::Running {
            Ok(!loops.contains_key(&campaign_id))
        } else {
            Err(DispatchError::InvalidState {
                campaign_id,
                action,
                status: now,
            })
        }
    }

    async fn launch(
        &self,
        campaign_id: i64,
        action: &'static str,
        startable: &[CampaignStatus],
    ) -> Result<LaunchOutcome, DispatchError> {
        let mut loops = self.inner.loops.lock().await;
        if !self.gate(&loops, campaign_id, action, startable).await? {
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        let db = &self.inner.db;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);
        loops.insert(
            campaign_id,
            LoopEntry {
                token: token.clone(),
                generation,
                finished: finished_rx,
            },
        );

        let campaign_loop = CampaignLoop {
            db: db.clone(),
            connections: Arc::clone(&self.inner.connections),
            campaign_id,
            token,
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match campaign_loop.run().await {
                Ok(summary) => info!(
                    campaign_id,
                    sent = summary.sent,
                    failed = summary.failed,
                    "campaign loop finished"
                ),
                Err(e) => error!(campaign_id, error = %e, "campaign loop aborted"),
            }
            {
                let mut loops = inner.loops.lock().await;
                if loops
                    .get(&campaign_id)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    loops.remove(&campaign_id);
                }
            }
            finished_tx.send_replace(true);
        });

        info!(campaign_id, action, "campaign loop launched");
        Ok(LaunchOutcome::Launched)
    }

    /// Pause a running campaign. The live loop stops at the next recipient
    /// boundary. Pausing a paused campaign is a no-op.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NotFound`] for an unknown id, or
    /// [`DispatchError::InvalidState`] unless the campaign is running or paused.
    pub async fn pause(&self, campaign_id: i64) -> Result<(), DispatchError> {
        let db = &self.inner.db;
        let moved = campaigns::transition(
            db,
            campaign_id,
            &[CampaignStatus::Running],
            CampaignStatus::Paused,
        )
        .await?;
        if !moved {
            let status = campaigns::status(db, campaign_id)
                .await?
                .ok_or(DispatchError::NotFound(campaign_id))?;
            if status != CampaignStatus::Paused {
                return Err(DispatchError::InvalidState {
                    campaign_id,
                    action: "pause",
                    status,
                });
            }
        }
        self.cancel(campaign_id).await;
        info!(campaign_id, "campaign paused");
        Ok(())
    }

    /// Signal the live loop, if any, to stop at the next recipient boundary.
    pub async fn cancel(&self, campaign_id: i64) {
        if let Some(entry) = self.inner.loops.lock().await.get(&campaign_id) {
            entry.token.cancel();
        }
    }

    /// Wait until the live loop, if any, has exited.
    pub async fn wait(&self, campaign_id: i64) {
        let finished = self
            .inner
            .loops
            .lock()
            .await
            .get(&campaign_id)
            .map(|entry| entry.finished.clone());
        if let Some(mut finished) = finished {
            // A dropped sender also means the loop is gone.
            let _ = finished.wait_for(|done| *done).await;
        }
    }

    /// Whether a loop for this campaign is live in this process.
    pub async fn is_active(&self, campaign_id: i64) -> bool {
        self.inner.loops.lock().await.contains_key(&campaign_id)
    }

    /// Ids of campaigns with a live loop.
    pub async fn active_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.loops.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Move `failed` recipients back to `pending`.
    ///
    /// A `completed` campaign that gets recipients back returns to `paused`
    /// so it can be resumed. Returns the number of recipients requeued.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NotFound`] for an unknown id.
    pub async fn requeue_failed(&self, campaign_id: i64) -> Result<u64, DispatchError> {
        let db = &self.inner.db;
        if campaigns::status(db, campaign_id).await?.is_none() {
            return Err(DispatchError::NotFound(campaign_id));
        }
        let requeued = recipients::requeue_failed(db, campaign_id).await?;
        if requeued > 0
            && campaigns::transition(
                db,
                campaign_id,
                &[CampaignStatus::Completed],
                CampaignStatus::Paused,
            )
            .await?
        {
            info!(campaign_id, "completed campaign reopened as paused");
        }
        info!(campaign_id, requeued, "failed recipients requeued");
        Ok(requeued)
    }

    /// Cancel every live loop and wait for all of them to exit.
    ///
    /// Campaign statuses are left as they are, so running campaigns resume on
    /// the next start of the process.
    pub async fn shutdown(&self) {
        let ids = self.active_ids().await;
        for id in &ids {
            self.cancel(*id).await;
        }
        for id in ids {
            self.wait(id).await;
        }
        info!("dispatcher stopped");
    }
}
