use std::fmt;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use crate::{credentials::Credentials, error::SocketError};

// ── Disconnect reasons ───────────────────────────────────────────────────────

/// Why the remote side closed a connection, keyed by the network status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The linked identity removed this device. Not recoverable.
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    ServiceUnavailable,
    /// Sent right after a successful scan; the socket must be reopened.
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "status {code}"),
            known => write!(f, "{known:?} ({})", known.status_code()),
        }
    }
}

// ── Events and commands ──────────────────────────────────────────────────────

/// Lifecycle notifications emitted by an open socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A fresh pairing payload to be shown as a QR code.
    PairingCode(String),
    Opened,
    Closed(DisconnectReason),
    /// New snapshot of the auth material; replaces the previous one.
    CredentialsUpdated(Credentials),
}

/// Outbound command routed to a connected socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketCommand {
    SendText {
        to: String,
        text: String,
    },
    /// Adapter-specific command passed through untouched.
    Custom {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

// ── Store projection ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A message as held in the socket's in-memory store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Plain text body.
    #[serde(default)]
    pub conversation: Option<String>,
    /// Text of a reply/link-preview message.
    #[serde(default)]
    pub extended_text: Option<String>,
}

// ── Capability traits ────────────────────────────────────────────────────────

/// A freshly opened socket together with its event stream.
pub struct OpenedSocket {
    pub socket: Box<dyn RemoteSocket>,
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Opens physical connections to the messaging network.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a link for `session_id`. Without credentials the socket is
    /// expected to start pairing and emit `PairingCode` events.
    async fn open(
        &self,
        session_id: &str,
        credentials: Option<Credentials>,
    ) -> Result<OpenedSocket, SocketError>;
}

/// One open link. Owned by exactly one session.
#[async_trait]
pub trait RemoteSocket: Send + Sync {
    async fn send(&self, command: SocketCommand) -> Result<serde_json::Value, SocketError>;

    /// Unlink this device from the remote identity.
    async fn logout(&self) -> Result<(), SocketError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, SocketError>;

    async fn list_messages(&self, conversation_id: &str)
    -> Result<Vec<StoredMessage>, SocketError>;

    /// Release the underlying connection. Must be idempotent.
    async fn close(&self);
}
