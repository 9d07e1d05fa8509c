//! Connection manager: one persistent protocol session per tenant.
//!
//! The [`ConnectionManager`] is the registry of live sessions. Each tenant has
//! a slot guarded by its own lock, so operations on one tenant are serialized
//! while different tenants never wait on each other. Inside a slot lives a
//! [`SessionHandle`] whose actor task drives the state machine:
//!
//! ```text
//! uninitialized -> connecting -> qr_ready | pairing -> connected
//! connected -> disconnected -> reconnecting -> connecting
//! disconnected -> logged_out            (terminal, row purged)
//! ```

pub mod backoff;
mod session;
mod state;
mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{connections, StoreError};
use crate::transport::{self, Connector, TransportError};

pub use backoff::Backoff;
pub use session::SessionHandle;
pub use state::{CloseReason, ConnectionStatus};

use supervisor::SessionActor;

/// Longest accepted tenant identity.
const MAX_TENANT_ID_LEN: usize = 64;

/// Errors from connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Transport call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Tenant identity is empty, too long, or contains unsafe characters.
    #[error("invalid tenant id: {0:?}")]
    InvalidTenant(String),

    /// Phone number has no digits.
    #[error("invalid phone number: {0:?}")]
    InvalidPhone(String),

    /// Tenant session is not connected.
    #[error("tenant {0} is not connected")]
    NotConnected(String),

    /// Tenant session is already authenticated.
    #[error("tenant {0} is already connected")]
    AlreadyConnected(String),

    /// The session did not reach the expected state in time.
    #[error("tenant {tenant_id} did not become ready within {waited_ms} ms")]
    Timeout {
        /// Tenant identity.
        tenant_id: String,
        /// How long we waited.
        waited_ms: u64,
    },

    /// The session ended while waiting on it.
    #[error("session for tenant {0} ended")]
    SessionClosed(String),
}

/// Point-in-time view of one tenant's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Tenant identity.
    pub tenant_id: String,
    /// Current status.
    pub status: ConnectionStatus,
    /// Consecutive reconnect attempts.
    pub reconnect_attempts: u32,
}

type Slot = Arc<Mutex<Option<SessionHandle>>>;

/// Registry of per-tenant sessions.
pub struct ConnectionManager {
    db: SqlitePool,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    pairing_wait: Duration,
    slots: std::sync::Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backoff", &self.backoff)
            .field("pairing_wait", &self.pairing_wait)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create an empty registry.
    pub fn new(
        db: SqlitePool,
        connector: Arc<dyn Connector>,
        backoff: Backoff,
        pairing_wait: Duration,
    ) -> Self {
        Self {
            db,
            connector,
            backoff,
            pairing_wait,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the slot for a tenant. The outer lock is held only
    /// for the map lookup.
    fn slot(&self, tenant_id: &str) -> Slot {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(slots.entry(tenant_id.to_owned()).or_default())
    }

    fn existing_slot(&self, tenant_id: &str) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(tenant_id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<(String, Slot)> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(tenant, slot)| (tenant.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Return the live session for `tenant_id`, starting one if needed.
    ///
    /// Safe to call concurrently: the tenant never has two live sessions.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidTenant`] for a malformed identity.
    pub async fn get_or_create(&self, tenant_id: &str) -> Result<SessionHandle, ConnectionError> {
        validate_tenant_id(tenant_id)?;
        let slot = self.slot(tenant_id);
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return Ok(handle.clone());
            }
            handle.stop().await;
        }
        let handle = self.launch(tenant_id).await;
        *guard = Some(handle.clone());
        Ok(handle)
    }

    async fn launch(&self, tenant_id: &str) -> SessionHandle {
        // A new handle has no transport yet, so a row left at `connected`
        // by the previous session only means a connect is on its way.
        let initial = match connections::get(&self.db, tenant_id).await {
            Ok(Some(record)) if record.status == ConnectionStatus::Connected => {
                ConnectionStatus::Connecting
            }
            Ok(Some(record)) => record.status,
            Ok(None) => ConnectionStatus::Uninitialized,
            Err(e) => {
                warn!(tenant = tenant_id, error = %e, "could not read connection record");
                ConnectionStatus::Uninitialized
            }
        };
        let handle = SessionHandle::new(tenant_id, self.db.clone(), initial);
        SessionActor {
            handle: handle.clone(),
            connector: Arc::clone(&self.connector),
            backoff: self.backoff.clone(),
        }
        .spawn()
        .await;
        handle
    }

    /// Current status of a tenant's connection.
    ///
    /// Falls back to the persisted row when no session lives in this process.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed identity or a store failure.
    pub async fn status(&self, tenant_id: &str) -> Result<ConnectionStatus, ConnectionError> {
        validate_tenant_id(tenant_id)?;
        if let Some(slot) = self.existing_slot(tenant_id) {
            if let Some(handle) = slot.lock().await.as_ref() {
                return Ok(handle.status());
            }
        }
        Ok(connections::get(&self.db, tenant_id)
            .await?
            .map_or(ConnectionStatus::Uninitialized, |record| record.status))
    }

    /// Consecutive reconnect attempts of the live session, if any.
    pub async fn attempts(&self, tenant_id: &str) -> Option<u32> {
        let slot = self.existing_slot(tenant_id)?;
        let guard = slot.lock().await;
        guard.as_ref().map(SessionHandle::reconnect_attempts)
    }

    /// Ask the protocol server for a numeric pairing code.
    ///
    /// Starts a session if needed and waits (up to the configured pairing
    /// wait) for it to reach the pairing flow.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::AlreadyConnected`] when the tenant is
    /// already authenticated, [`ConnectionError::Timeout`] if the session never
    /// offers pairing, or the transport's error.
    pub async fn request_pairing_code(
        &self,
        tenant_id: &str,
        phone_number: &str,
    ) -> Result<String, ConnectionError> {
        let phone = transport::normalize_phone(phone_number);
        if phone.is_empty() {
            return Err(ConnectionError::InvalidPhone(phone_number.to_owned()));
        }
        let handle = self.get_or_create(tenant_id).await?;
        let status = handle
            .wait_for(self.pairing_wait, |s| {
                s.is_awaiting_pairing() || s == ConnectionStatus::Connected
            })
            .await?;
        if status == ConnectionStatus::Connected {
            return Err(ConnectionError::AlreadyConnected(tenant_id.to_owned()));
        }
        let transport = handle
            .transport()
            .await
            .ok_or_else(|| ConnectionError::NotConnected(tenant_id.to_owned()))?;
        let code = transport.request_pairing_code(&phone).await?;
        handle
            .set_status(
                ConnectionStatus::Pairing,
                connections::StatusUpdate {
                    qr: None,
                    pairing_code: Some(&code),
                },
            )
            .await;
        info!(tenant = tenant_id, "pairing code issued");
        Ok(code)
    }

    /// Close the tenant's session, keeping credentials for a later resume.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidTenant`] for a malformed identity.
    pub async fn disconnect(&self, tenant_id: &str) -> Result<(), ConnectionError> {
        validate_tenant_id(tenant_id)?;
        let Some(slot) = self.existing_slot(tenant_id) else {
            return Ok(());
        };
        let guard = slot.lock().await;
        if let Some(handle) = guard.as_ref() {
            handle.stop().await;
            info!(tenant = tenant_id, "session disconnected");
        }
        Ok(())
    }

    /// Tear the session down and start a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidTenant`] for a malformed identity.
    pub async fn restart(&self, tenant_id: &str) -> Result<SessionHandle, ConnectionError> {
        validate_tenant_id(tenant_id)?;
        let slot = self.slot(tenant_id);
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.take() {
            handle.stop().await;
        }
        let handle = self.launch(tenant_id).await;
        *guard = Some(handle.clone());
        info!(tenant = tenant_id, "session restarted");
        Ok(handle)
    }

    /// Log the account out and purge its record. Terminal: a new session
    /// must pair again.
    ///
    /// A failing transport logout is logged and the local purge still runs.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed identity or a store failure.
    pub async fn logout(&self, tenant_id: &str) -> Result<(), ConnectionError> {
        validate_tenant_id(tenant_id)?;
        let slot = self.slot(tenant_id);
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.take() {
            if let Some(transport) = handle.transport().await {
                if let Err(e) = transport.logout().await {
                    warn!(
                        tenant = tenant_id,
                        error = %e,
                        "transport logout failed, purging locally"
                    );
                }
            }
            handle.stop().await;
        }
        connections::delete(&self.db, tenant_id).await?;
        *guard = Some(SessionHandle::ended(
            tenant_id,
            self.db.clone(),
            ConnectionStatus::LoggedOut,
        ));
        info!(tenant = tenant_id, "tenant logged out");
        Ok(())
    }

    /// Resume every tenant that has stored credentials.
    ///
    /// Returns the number of sessions started.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored connections cannot be listed.
    pub async fn restore_all(&self) -> Result<usize, ConnectionError> {
        let tenants = connections::resumable(&self.db).await?;
        let mut restored: usize = 0;
        for tenant in tenants {
            match self.get_or_create(&tenant).await {
                Ok(_) => restored = restored.saturating_add(1),
                Err(e) => warn!(tenant = %tenant, error = %e, "skipping unrestorable connection"),
            }
        }
        info!(restored, "connections restored");
        Ok(restored)
    }

    /// Status of every session known to this process.
    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::new();
        for (tenant_id, slot) in self.all_slots() {
            if let Some(handle) = slot.lock().await.as_ref() {
                out.push(SessionSnapshot {
                    tenant_id,
                    status: handle.status(),
                    reconnect_attempts: handle.reconnect_attempts(),
                });
            }
        }
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }

    /// Stop every session, keeping credentials.
    pub async fn shutdown(&self) {
        for (tenant_id, slot) in self.all_slots() {
            if let Some(handle) = slot.lock().await.as_ref() {
                handle.stop().await;
                info!(tenant = %tenant_id, "session stopped for shutdown");
            }
        }
    }
}

/// Check that a tenant identity is usable as a row key and URL path segment.
///
/// # Errors
///
/// Returns [`ConnectionError::InvalidTenant`] when the identity is empty,
/// longer than 64 bytes, or contains characters other than ASCII
/// alphanumerics, `-`, `_` and `.`.
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), ConnectionError> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LEN
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConnectionError::InvalidTenant(tenant_id.to_owned()))
    }
}
