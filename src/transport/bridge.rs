//! HTTP client for the protocol bridge sidecar.
//!
//! The sidecar hosts one protocol session per tenant under
//! `/sessions/{tenant}` and answers with a `{success, data, error}` envelope.
//! Connectivity events are pulled from `/sessions/{tenant}/events/poll` by a
//! background [`poller`](super::poller) task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BridgeConfig;

use super::poller::{spawn_event_poller, PollerSettings};
use super::{normalize_phone, Connector, Transport, TransportError, TransportSession};

/// Capacity of the per-session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Domain suffix of individual chat addresses.
const USER_ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Pairing-code payload returned by the bridge.
#[derive(Deserialize)]
struct PairingCode {
    code: String,
}

/// Opens bridge sessions.
pub struct BridgeConnector {
    client: reqwest::Client,
    base_url: String,
    poll: PollerSettings,
}

impl std::fmt::Debug for BridgeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConnector")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BridgeConnector {
    /// Create a connector for the bridge described by `config`.
    pub fn new(config: &BridgeConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            poll: PollerSettings {
                timeout: Duration::from_secs(config.poll_timeout_secs),
                max_backoff: Duration::from_millis(config.poll_max_backoff_ms),
            },
        }
    }

    /// Base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(
        &self,
        tenant_id: &str,
        credentials: Option<String>,
    ) -> Result<TransportSession, TransportError> {
        let session_url = format!("{}/sessions/{tenant_id}", self.base_url);
        let body = serde_json::json!({ "credentials": credentials });
        let resp = self
            .client
            .post(format!("{session_url}/start"))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::ConnectFailed(format!("{status}: {text}")));
        }
        debug!(
            tenant = tenant_id,
            resumed = body["credentials"].is_string(),
            "bridge session started"
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        spawn_event_poller(
            format!("{session_url}/events/poll"),
            self.poll.clone(),
            event_tx,
            cancel.clone(),
        );

        let transport = BridgeTransport {
            client: self.client.clone(),
            session_url,
            cancel,
        };
        Ok(TransportSession {
            transport: Arc::new(transport),
            events: event_rx,
        })
    }
}

/// One bridge session.
pub struct BridgeTransport {
    client: reqwest::Client,
    session_url: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BridgeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTransport")
            .field("session_url", &self.session_url)
            .finish_non_exhaustive()
    }
}

impl BridgeTransport {
    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Option<T>, TransportError> {
        let url = format!("{}/{path}", self.session_url);
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(TransportError::NotConnected);
        }
        let envelope: BridgeResponse<T> = resp.json().await.map_err(|e| {
            TransportError::Rejected(format!("{status}: unreadable bridge response: {e}"))
        })?;
        if !status.is_success() || envelope.error.is_some() {
            let message = envelope
                .error
                .unwrap_or_else(|| format!("bridge returned {status}"));
            return Err(TransportError::Rejected(message));
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError> {
        let jid = to_jid(to)?;
        self.post::<serde_json::Value>("send", serde_json::json!({ "jid": jid, "text": text }))
            .await?;
        debug!(jid, "text sent via bridge");
        Ok(())
    }

    async fn send_image(
        &self,
        to: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), TransportError> {
        let jid = to_jid(to)?;
        let body = serde_json::json!({ "jid": jid, "url": url, "caption": caption });
        self.post::<serde_json::Value>("send-image", body).await?;
        debug!(jid, "image sent via bridge");
        Ok(())
    }

    async fn send_document(
        &self,
        to: &str,
        url: &str,
        file_name: &str,
        caption: Option<&str>,
    ) -> Result<(), TransportError> {
        let jid = to_jid(to)?;
        let body = serde_json::json!({
            "jid": jid,
            "url": url,
            "filename": file_name,
            "caption": caption,
        });
        self.post::<serde_json::Value>("send-document", body).await?;
        debug!(jid, "document sent via bridge");
        Ok(())
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError> {
        let phone = normalize_phone(phone_number);
        if phone.is_empty() {
            return Err(TransportError::InvalidAddress(phone_number.to_owned()));
        }
        let data: Option<PairingCode> = self
            .post("pairing-code", serde_json::json!({ "phone": phone }))
            .await?;
        data.map(|p| p.code)
            .ok_or_else(|| TransportError::Rejected("no pairing code returned".to_owned()))
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.post::<serde_json::Value>("logout", serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        // Best effort: the sidecar drops idle sessions on its own.
        if let Err(e) = self.client.delete(&self.session_url).send().await {
            debug!(error = %e, url = %self.session_url, "bridge session delete failed");
        }
    }
}

/// Turn a phone number (or an already-qualified address) into a chat address.
///
/// # Errors
///
/// Returns [`TransportError::InvalidAddress`] when no digits remain.
pub fn to_jid(address: &str) -> Result<String, TransportError> {
    if address.contains('@') {
        return Ok(address.to_owned());
    }
    let digits = normalize_phone(address);
    if digits.is_empty() {
        return Err(TransportError::InvalidAddress(address.to_owned()));
    }
    Ok(format!("{digits}{USER_ADDRESS_SUFFIX}"))
}
