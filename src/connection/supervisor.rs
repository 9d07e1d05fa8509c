//! Per-tenant session actor.
//!
//! One task per tenant owns the connect / observe / reconnect cycle. It is the
//! only writer of the tenant's connection row while it runs, so status changes
//! for a tenant are applied in order.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::store::connections::{self, StatusUpdate};
use crate::transport::{Connector, TransportEvent, TransportSession};

use super::backoff::Backoff;
use super::session::SessionHandle;
use super::{CloseReason, ConnectionStatus};

/// Everything the actor needs.
pub(crate) struct SessionActor {
    pub handle: SessionHandle,
    pub connector: Arc<dyn Connector>,
    pub backoff: Backoff,
}

impl SessionActor {
    /// Spawn the actor and attach its task to the handle.
    pub(crate) async fn spawn(self) {
        let handle = self.handle.clone();
        let task = tokio::spawn(self.run());
        handle.attach_task(task).await;
    }

    async fn run(self) {
        let tenant = self.handle.tenant_id().to_owned();
        let cancel = self.handle.cancel_token().clone();
        info!(tenant = %tenant, "session actor started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.handle
                .set_status(ConnectionStatus::Connecting, StatusUpdate::default())
                .await;

            let credentials = match connections::load_credentials(self.handle.db(), &tenant).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    error!(
                        tenant = %tenant,
                        error = %e,
                        "failed to load credentials, pairing afresh"
                    );
                    None
                }
            };
            let resuming = credentials.is_some();

            let opened = tokio::select! {
                opened = self.connector.connect(&tenant, credentials) => opened,
                () = cancel.cancelled() => break,
            };

            let reason = match opened {
                Ok(session) => {
                    info!(tenant = %tenant, resuming, "session opened");
                    self.drive(session).await
                }
                Err(e) => {
                    warn!(tenant = %tenant, error = %e, "connect failed");
                    CloseReason::ConnectionLost(e.to_string())
                }
            };

            self.handle
                .set_status(ConnectionStatus::Disconnected, StatusUpdate::default())
                .await;

            if reason.is_terminal() {
                self.purge().await;
                break;
            }
            if cancel.is_cancelled() {
                break;
            }

            if reason == CloseReason::RestartRequired {
                info!(tenant = %tenant, "restart requested by server, reconnecting now");
                continue;
            }

            let attempt = self.handle.bump_attempts().await;
            let delay = self.backoff.delay(attempt);
            self.handle
                .set_status(ConnectionStatus::Reconnecting, StatusUpdate::default())
                .await;
            info!(
                tenant = %tenant,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                reason = %reason,
                "reconnect scheduled"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => break,
            }
        }

        if !matches!(
            self.handle.status(),
            ConnectionStatus::Disconnected | ConnectionStatus::LoggedOut
        ) {
            self.handle
                .set_status(ConnectionStatus::Disconnected, StatusUpdate::default())
                .await;
        }
        info!(tenant = %tenant, status = %self.handle.status(), "session actor stopped");
    }

    /// Consume events of one open session until it closes.
    async fn drive(&self, session: TransportSession) -> CloseReason {
        let TransportSession {
            transport,
            mut events,
        } = session;
        let tenant = self.handle.tenant_id();
        let cancel = self.handle.cancel_token();
        self.handle.set_transport(Some(Arc::clone(&transport))).await;

        let reason = loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = cancel.cancelled() => break CloseReason::Closed,
            };
            let Some(event) = event else {
                break CloseReason::ConnectionLost("event stream ended".to_owned());
            };
            match event {
                TransportEvent::Qr { code } => {
                    self.handle
                        .set_status(
                            ConnectionStatus::QrReady,
                            StatusUpdate {
                                qr: Some(&code),
                                pairing_code: None,
                            },
                        )
                        .await;
                }
                TransportEvent::PairingCode { code } => {
                    self.handle
                        .set_status(
                            ConnectionStatus::Pairing,
                            StatusUpdate {
                                qr: None,
                                pairing_code: Some(&code),
                            },
                        )
                        .await;
                }
                TransportEvent::Open {
                    phone_number,
                    profile_picture_url,
                } => {
                    self.handle.reset_attempts().await;
                    self.handle
                        .set_status(ConnectionStatus::Connected, StatusUpdate::default())
                        .await;
                    if let Err(e) = connections::save_profile(
                        self.handle.db(),
                        tenant,
                        phone_number.as_deref(),
                        profile_picture_url.as_deref(),
                    )
                    .await
                    {
                        error!(tenant, error = %e, "failed to persist profile");
                    }
                }
                TransportEvent::CredentialsUpdated { blob } => {
                    if let Err(e) =
                        connections::save_credentials(self.handle.db(), tenant, &blob).await
                    {
                        error!(tenant, error = %e, "failed to persist credentials");
                    }
                }
                TransportEvent::Close { reason } => break reason,
            }
        };

        self.handle.set_transport(None).await;
        transport.close().await;
        reason
    }

    /// Remove every trace of a logged-out tenant.
    async fn purge(&self) {
        let tenant = self.handle.tenant_id();
        self.handle.set_status_in_memory(ConnectionStatus::LoggedOut);
        match connections::delete(self.handle.db(), tenant).await {
            Ok(_) => info!(tenant, "logged out, connection record purged"),
            Err(e) => error!(tenant, error = %e, "failed to purge connection record"),
        }
    }
}
