//! Multi-session messaging gateway core.
//!
//! A `SessionRegistry` owns one actor task per session id. Each task holds
//! a single socket opened through a `SocketConnector`, walks it through
//! pairing, keeps it connected with bounded backoff and persists the
//! credential snapshots it emits. Callers send commands and fetch stored
//! messages through the registry; they never touch a socket directly.

pub mod aggregate;
pub mod bridge;
pub mod error;
pub mod pairing;
pub mod policy;
pub mod registry;
pub mod session;
pub mod settings;
pub mod store;

pub use {
    aggregate::{FetchWindow, MessageBatch, MessageRecord, SkippedConversation},
    bridge::StdioBridgeConnector,
    error::{GatewayError, Result},
    pairing::PairingArtifact,
    policy::{Backoff, ReconnectDecision},
    registry::{LogoutOutcome, SessionRegistry, SessionStatus, StartOutcome, validate_session_id},
    session::{SessionHandle, SessionSnapshot, SessionState, TerminationCause},
    settings::SessionSettings,
    store::{FileCredentialStore, SledCredentialStore, open_store},
};
