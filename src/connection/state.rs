//! Connection lifecycle states and close reasons.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Lifecycle status of a tenant's protocol connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session has ever been requested for this tenant.
    Uninitialized,
    /// A session is being opened.
    Connecting,
    /// A QR code is waiting to be scanned.
    QrReady,
    /// A numeric pairing code is waiting to be entered on the phone.
    Pairing,
    /// The session is authenticated and can send.
    Connected,
    /// The transport closed the session.
    Disconnected,
    /// Waiting out the backoff before the next connect attempt.
    Reconnecting,
    /// The account was logged out; credentials are gone. Terminal.
    LoggedOut,
}

impl ConnectionStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::QrReady => "qr_ready",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::LoggedOut => "logged_out",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "uninitialized" => Ok(Self::Uninitialized),
            "connecting" => Ok(Self::Connecting),
            "qr_ready" => Ok(Self::QrReady),
            "pairing" => Ok(Self::Pairing),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "reconnecting" => Ok(Self::Reconnecting),
            "logged_out" => Ok(Self::LoggedOut),
            other => Err(StoreError::InvalidEnum {
                field: "connection status",
                value: other.to_owned(),
            }),
        }
    }

    /// Check if transitioning to `target` is valid.
    ///
    /// Re-entering the current state is always allowed (a new QR code replaces
    /// the previous one without leaving `qr_ready`).
    pub fn can_transition_to(&self, target: ConnectionStatus) -> bool {
        if *self == target {
            return true;
        }
        matches!(
            (self, target),
            (Self::Uninitialized, ConnectionStatus::Connecting)
                | (Self::Connecting, ConnectionStatus::QrReady)
                | (Self::Connecting, ConnectionStatus::Pairing)
                | (Self::Connecting, ConnectionStatus::Connected)
                | (Self::Connecting, ConnectionStatus::Disconnected)
                | (Self::QrReady, ConnectionStatus::Pairing)
                | (Self::QrReady, ConnectionStatus::Connected)
                | (Self::QrReady, ConnectionStatus::Disconnected)
                | (Self::Pairing, ConnectionStatus::QrReady)
                | (Self::Pairing, ConnectionStatus::Connected)
                | (Self::Pairing, ConnectionStatus::Disconnected)
                | (Self::Connected, ConnectionStatus::Disconnected)
                | (Self::Disconnected, ConnectionStatus::Reconnecting)
                | (Self::Disconnected, ConnectionStatus::LoggedOut)
                | (Self::Disconnected, ConnectionStatus::Connecting)
                | (Self::Reconnecting, ConnectionStatus::Connecting)
                | (Self::Reconnecting, ConnectionStatus::Disconnected)
                | (Self::LoggedOut, ConnectionStatus::Connecting)
        )
    }

    /// Whether the session is in the middle of an interactive pairing flow.
    pub fn is_awaiting_pairing(&self) -> bool {
        matches!(self, Self::QrReady | Self::Pairing)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the transport closed a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// The account was logged out (from the phone or via [`logout`]). Terminal.
    ///
    /// [`logout`]: crate::transport::Transport::logout
    LoggedOut,
    /// The protocol server asked for a restart (e.g. right after pairing).
    RestartRequired,
    /// Network or server failure.
    ConnectionLost(String),
    /// The session was closed locally.
    Closed,
}

impl CloseReason {
    /// Whether this close ends the connection for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::ConnectionLost(detail) => write!(f, "connection lost: {detail}"),
            Self::Closed => f.write_str("closed"),
        }
    }
}
