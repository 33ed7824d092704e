//! Typed contract between the bridge runtime and a messaging-platform session.
//!
//! A connector produces one [`TransportConnection`] per session attempt: a
//! shared [`TransportSession`] handle for commands plus a channel of
//! [`TransportEvent`] values. Lifecycle events (open/close/pairing) and message
//! events travel on the same channel in arrival order; the runtime splits them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Disconnect reason reported by the transport when a session closes.
///
/// Numeric values follow the status codes the messaging platform attaches to a
/// socket close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectCode {
    LoggedOut,
    BadSession,
    Forbidden,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    RestartRequired,
    Unavailable,
    Other(u16),
}

impl DisconnectCode {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            500 => Self::BadSession,
            403 => Self::Forbidden,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            515 => Self::RestartRequired,
            503 => Self::Unavailable,
            other => Self::Other(other),
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::BadSession => 500,
            Self::Forbidden => 403,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionLost => 408,
            Self::ConnectionReplaced => 440,
            Self::RestartRequired => 515,
            Self::Unavailable => 503,
            Self::Other(code) => code,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::BadSession => "bad_session",
            Self::Forbidden => "forbidden",
            Self::MultideviceMismatch => "multidevice_mismatch",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionReplaced => "connection_replaced",
            Self::RestartRequired => "restart_required",
            Self::Unavailable => "unavailable",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for DisconnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.status_code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Structured failure kinds surfaced by transport commands.
pub enum TransportErrorKind {
    ChatNotFound,
    RecipientNotRegistered,
    NotAuthenticated,
    NotConnected,
    Timeout,
    Protocol,
    Io,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatNotFound => "chat_not_found",
            Self::RecipientNotRegistered => "recipient_not_registered",
            Self::NotAuthenticated => "not_authenticated",
            Self::NotConnected => "not_connected",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Io => "io",
        }
    }

    /// Maps a wire-level kind label to a kind, treating unknown labels as protocol errors.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim() {
            "chat_not_found" => Self::ChatNotFound,
            "recipient_not_registered" => Self::RecipientNotRegistered,
            "not_authenticated" => Self::NotAuthenticated,
            "not_connected" => Self::NotConnected,
            "timeout" => Self::Timeout,
            "io" => Self::Io,
            _ => Self::Protocol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {}", .kind.as_str(), .detail)]
/// Public struct `TransportError` returned by every transport command.
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_connected(detail: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotConnected, detail)
    }
}

/// Opaque credential blob owned by the transport; the bridge only persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCredentials(pub Value);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `ConnectionUpdate` values.
pub enum ConnectionUpdate {
    Connecting,
    PairingRequired { challenge: String },
    Open { own_address: Option<String> },
    Closed {
        code: DisconnectCode,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
/// One message as reported by the transport, before any normalization.
pub struct RawInboundMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    /// Chat address: the peer for direct chats, the group for group chats.
    pub remote_address: String,
    /// Sender inside a group chat.
    #[serde(default)]
    pub participant_address: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatusUpdate {
    pub message_id: String,
    pub status_code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `TransportEvent` values.
pub enum TransportEvent {
    Connection(ConnectionUpdate),
    CredentialsUpdated(SessionCredentials),
    MessagesUpserted(Vec<RawInboundMessage>),
    MessageStatusUpdated(Vec<MessageStatusUpdate>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetadata {
    pub group_address: String,
    pub subject: String,
}

#[async_trait]
/// Command surface of one live transport session.
pub trait TransportSession: Send + Sync {
    async fn send_text(&self, target: &str, text: &str) -> Result<SentMessage, TransportError>;

    async fn group_metadata(&self, group_address: &str) -> Result<GroupMetadata, TransportError>;

    /// Unlinks the device from the account. Credentials become useless afterwards.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Closes the socket without touching credentials.
    async fn end(&self);
}

/// A live session plus the event stream it produces.
pub struct TransportConnection {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
/// Trait contract for `TransportConnector` behavior.
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: Option<SessionCredentials>,
    ) -> Result<TransportConnection, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::{DisconnectCode, TransportError, TransportErrorKind};

    #[test]
    fn unit_disconnect_code_round_trips_known_status_codes() {
        for code in [401, 500, 403, 411, 428, 408, 440, 515, 503] {
            assert_eq!(DisconnectCode::from_status_code(code).status_code(), code);
        }
        assert_eq!(
            DisconnectCode::from_status_code(499),
            DisconnectCode::Other(499)
        );
    }

    #[test]
    fn unit_transport_error_kind_from_wire_falls_back_to_protocol() {
        assert_eq!(
            TransportErrorKind::from_wire("recipient_not_registered"),
            TransportErrorKind::RecipientNotRegistered
        );
        assert_eq!(
            TransportErrorKind::from_wire("something-new"),
            TransportErrorKind::Protocol
        );
    }

    #[test]
    fn unit_transport_error_display_includes_kind_and_detail() {
        let error = TransportError::new(TransportErrorKind::ChatNotFound, "no such chat");
        assert_eq!(error.to_string(), "chat_not_found: no such chat");
    }
}
