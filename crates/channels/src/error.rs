/// Failures raised by a socket adapter.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket is closed")]
    Closed,

    #[error("{0} timed out")]
    Timeout(String),

    #[error("failed to spawn bridge: {0}")]
    Spawn(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("malformed frame: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
