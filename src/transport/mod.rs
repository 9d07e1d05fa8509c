//! Transport capability: open an authenticated chat session for a tenant,
//! observe its connectivity events, and send messages.
//!
//! The protocol itself is opaque. [`Connector`] opens sessions, each yielding a
//! [`Transport`] handle plus a stream of [`TransportEvent`]s. The production
//! implementation is the HTTP [`bridge`] to a protocol sidecar; tests substitute
//! a fake.

pub mod bridge;
mod poller;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::connection::CloseReason;

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP request to the bridge failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The session is not connected.
    #[error("not connected")]
    NotConnected,

    /// The bridge or protocol server rejected the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The address could not be turned into a protocol address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The session could not be opened.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// Connectivity events emitted by an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A new QR payload to scan.
    Qr {
        /// QR payload (opaque text).
        code: String,
    },
    /// A numeric pairing code to enter on the phone.
    PairingCode {
        /// The code.
        code: String,
    },
    /// The session is authenticated.
    Open {
        /// Phone number of the linked account.
        #[serde(default)]
        phone_number: Option<String>,
        /// Profile picture of the linked account.
        #[serde(default)]
        profile_picture_url: Option<String>,
    },
    /// The session closed.
    Close {
        /// Why it closed.
        reason: CloseReason,
    },
    /// The credential blob changed and must be persisted.
    CredentialsUpdated {
        /// Opaque credentials.
        blob: String,
    },
}

/// A message ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Plain text.
    Text {
        /// Body.
        text: String,
    },
    /// Image with optional caption.
    Image {
        /// Media location.
        url: String,
        /// Caption.
        caption: Option<String>,
    },
    /// Document with optional caption.
    Document {
        /// Media location.
        url: String,
        /// File name shown to the recipient.
        file_name: String,
        /// Caption.
        caption: Option<String>,
    },
}

/// Handle to one open session.
///
/// All implementations must be `Send + Sync` so the handle can be shared
/// between the connection supervisor and campaign loops.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a text message.
    async fn send_text(&self, to: &str, text: &str) -> Result<(), TransportError>;

    /// Send an image by URL.
    async fn send_image(
        &self,
        to: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Send a document by URL.
    async fn send_document(
        &self,
        to: &str,
        url: &str,
        file_name: &str,
        caption: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Ask the protocol server for a numeric pairing code for `phone_number`.
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError>;

    /// Log the account out. The session then closes with [`CloseReason::LoggedOut`].
    async fn logout(&self) -> Result<(), TransportError>;

    /// Close the session locally without logging out.
    async fn close(&self);
}

/// A freshly opened session.
pub struct TransportSession {
    /// Handle for sending and control calls.
    pub transport: Arc<dyn Transport>,
    /// Connectivity events, ending when the session is gone.
    pub events: mpsc::Receiver<TransportEvent>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession").finish_non_exhaustive()
    }
}

/// Opens sessions for tenants.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session, resuming from `credentials` when present.
    ///
    /// Without credentials the session starts an interactive pairing flow and
    /// emits [`TransportEvent::Qr`].
    async fn connect(
        &self,
        tenant_id: &str,
        credentials: Option<String>,
    ) -> Result<TransportSession, TransportError>;
}

/// Send a prepared message through a transport.
///
/// # Errors
///
/// Propagates the transport's error.
pub async fn send_message(
    transport: &dyn Transport,
    to: &str,
    message: &OutboundMessage,
) -> Result<(), TransportError> {
    match message {
        OutboundMessage::Text { text } => transport.send_text(to, text).await,
        OutboundMessage::Image { url, caption } => {
            transport.send_image(to, url, caption.as_deref()).await
        }
        OutboundMessage::Document {
            url,
            file_name,
            caption,
        } => {
            transport
                .send_document(to, url, file_name, caption.as_deref())
                .await
        }
    }
}

/// Strip everything but ASCII digits from a phone number.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}
