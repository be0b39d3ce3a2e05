//! Remote socket capability and credential persistence interfaces.
//!
//! A `SocketConnector` opens one physical link to the messaging network per
//! session. The link reports lifecycle changes as `SocketEvent`s and exposes
//! its local chat store through `RemoteSocket`. Credential material is kept
//! behind the `CredentialStore` trait so the session core never touches disk.

pub mod credentials;
pub mod error;
pub mod socket;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use {
    credentials::{CredentialStore, Credentials, MemoryCredentialStore},
    error::SocketError,
    socket::{
        ConversationSummary, DisconnectReason, OpenedSocket, RemoteSocket, SocketCommand,
        SocketConnector, SocketEvent, StoredMessage,
    },
};
