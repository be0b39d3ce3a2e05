use std::time::Duration;

use {wagate_channels::SocketError, wagate_protocol::error_codes};

/// Errors surfaced to callers of the session registry.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no pairing code for session {session_id} within {waited:?}")]
    PairingTimeout { session_id: String, waited: Duration },

    #[error("pairing for session {0} was cancelled")]
    PairingCancelled(String),

    #[error("a pairing or reconnect attempt is already active for session {0}")]
    PairingAlreadyActive(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is not connected")]
    SessionNotConnected(String),

    #[error("fetching messages for session {0} timed out")]
    FetchTimeout(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("adapter fault: {0}")]
    AdapterFault(#[from] SocketError),

    #[error("credential store: {0}")]
    Credentials(#[source] anyhow::Error),
}

impl GatewayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PairingTimeout { .. } => error_codes::PAIRING_TIMEOUT,
            Self::PairingCancelled(_) => error_codes::PAIRING_CANCELLED,
            Self::PairingAlreadyActive(_) => error_codes::PAIRING_ALREADY_ACTIVE,
            Self::SessionNotFound(_) => error_codes::SESSION_NOT_FOUND,
            Self::SessionNotConnected(_) => error_codes::SESSION_NOT_CONNECTED,
            Self::FetchTimeout(_) => error_codes::FETCH_TIMEOUT,
            Self::InvalidSessionId(_) => error_codes::INVALID_REQUEST,
            Self::AdapterFault(_) => error_codes::ADAPTER_FAULT,
            Self::Credentials(_) => error_codes::CREDENTIALS,
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PairingTimeout { .. }
                | Self::PairingCancelled(_)
                | Self::FetchTimeout(_)
                | Self::AdapterFault(_)
        )
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_wire_constants() {
        assert_eq!(
            GatewayError::InvalidSessionId("a/b".into()).code(),
            error_codes::INVALID_REQUEST
        );
        assert_eq!(GatewayError::FetchTimeout("s1".into()).code(), "FETCH_TIMEOUT");
        assert_eq!(
            GatewayError::Credentials(anyhow::anyhow!("disk full")).code(),
            error_codes::CREDENTIALS
        );
        assert!(GatewayError::FetchTimeout("s1".into()).is_retryable());
        assert!(!GatewayError::SessionNotFound("s1".into()).is_retryable());
    }
}
