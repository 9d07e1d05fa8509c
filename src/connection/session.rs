//! Cloneable handle to one tenant's session actor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::connections::{self, StatusUpdate};
use crate::transport::{self, OutboundMessage, Transport};

use super::{ConnectionError, ConnectionStatus};

/// State shared between the supervisor task and every handle clone.
struct SessionShared {
    tenant_id: String,
    db: SqlitePool,
    status_tx: watch::Sender<ConnectionStatus>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    attempts: AtomicU32,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a tenant's session.
///
/// Clones share the same session. The handle stays valid after the session
/// ends; [`is_finished`](Self::is_finished) then reports `true`.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("tenant_id", &self.shared.tenant_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Create a handle whose session has not started yet.
    pub(crate) fn new(tenant_id: &str, db: SqlitePool, initial: ConnectionStatus) -> Self {
        let (status_tx, _) = watch::channel(initial);
        Self {
            shared: Arc::new(SessionShared {
                tenant_id: tenant_id.to_owned(),
                db,
                status_tx,
                transport: RwLock::new(None),
                attempts: AtomicU32::new(0),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Create an already-ended handle carrying a final status.
    pub(crate) fn ended(tenant_id: &str, db: SqlitePool, status: ConnectionStatus) -> Self {
        let handle = Self::new(tenant_id, db, status);
        handle.shared.cancel.cancel();
        handle
    }

    /// Tenant identity.
    pub fn tenant_id(&self) -> &str {
        &self.shared.tenant_id
    }

    /// Current in-memory status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Whether the session actor has been told to stop or reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.shared.cancel.is_cancelled() || self.status() == ConnectionStatus::LoggedOut
    }

    /// Wait until the status satisfies `pred`, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Timeout`] if the status does not match in time.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(ConnectionStatus) -> bool,
    ) -> Result<ConnectionStatus, ConnectionError> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| pred(*s)))
            .await
            .map(|seen| seen.map(|status| *status));
        match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(ConnectionError::SessionClosed(self.tenant_id().to_owned())),
            Err(_) => Err(ConnectionError::Timeout {
                tenant_id: self.tenant_id().to_owned(),
                waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Send a message through the live transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] unless the session is
    /// `connected`, or the transport's error when the send itself fails.
    pub async fn send(&self, to: &str, message: &OutboundMessage) -> Result<(), ConnectionError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(ConnectionError::NotConnected(self.tenant_id().to_owned()));
        }
        let transport = self
            .transport()
            .await
            .ok_or_else(|| ConnectionError::NotConnected(self.tenant_id().to_owned()))?;
        transport::send_message(transport.as_ref(), to, message).await?;
        Ok(())
    }

    /// The live transport, if a session is open.
    pub(crate) async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.shared.transport.read().await.clone()
    }

    pub(crate) async fn set_transport(&self, transport: Option<Arc<dyn Transport>>) {
        *self.shared.transport.write().await = transport;
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    pub(crate) fn db(&self) -> &SqlitePool {
        &self.shared.db
    }

    pub(crate) async fn attach_task(&self, task: JoinHandle<()>) {
        *self.shared.task.lock().await = Some(task);
    }

    /// Ask the actor to stop and wait for it to exit.
    pub(crate) async fn stop(&self) {
        self.shared.cancel.cancel();
        let task = self.shared.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(tenant = self.tenant_id(), error = %e, "session task ended abnormally");
            }
        }
    }

    /// Record one more reconnect attempt and persist the counter.
    pub(crate) async fn bump_attempts(&self) -> u32 {
        let previous = self
            .shared
            .attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(1))
            })
            .unwrap_or(u32::MAX);
        let attempts = previous.saturating_add(1);
        self.persist_attempts(attempts).await;
        attempts
    }

    /// Reset the reconnect counter after a successful open.
    pub(crate) async fn reset_attempts(&self) {
        if self.shared.attempts.swap(0, Ordering::SeqCst) != 0 {
            self.persist_attempts(0).await;
        }
    }

    async fn persist_attempts(&self, attempts: u32) {
        if let Err(e) =
            connections::set_reconnect_attempts(self.db(), self.tenant_id(), attempts).await
        {
            error!(tenant = self.tenant_id(), error = %e, "failed to persist reconnect attempts");
        }
    }

    /// Move to `status` in memory and persist it with the pairing artifact.
    pub(crate) async fn set_status(&self, status: ConnectionStatus, update: StatusUpdate<'_>) {
        let previous = self.shared.status_tx.send_replace(status);
        if !previous.can_transition_to(status) {
            warn!(
                tenant = self.tenant_id(),
                from = previous.as_str(),
                to = status.as_str(),
                "unexpected connection transition"
            );
        }
        if previous == status {
            debug!(
                tenant = self.tenant_id(),
                status = status.as_str(),
                "connection status refreshed"
            );
        } else {
            info!(
                tenant = self.tenant_id(),
                from = previous.as_str(),
                to = status.as_str(),
                "connection status changed"
            );
        }
        if let Err(e) =
            connections::upsert_status(self.db(), self.tenant_id(), status, update).await
        {
            error!(tenant = self.tenant_id(), error = %e, "failed to persist connection status");
        }
    }

    /// Move to `status` in memory only (the row is gone after a logout).
    pub(crate) fn set_status_in_memory(&self, status: ConnectionStatus) {
        self.shared.status_tx.send_replace(status);
    }
}
