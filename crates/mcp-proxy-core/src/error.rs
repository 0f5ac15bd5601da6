use thiserror::Error;

/// Errors produced by transports, the session registry and the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport start failed: {0}")]
    TransportStart(String),

    #[error("invalid transport type: {0}")]
    InvalidTransportKind(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("send failed: {0}")]
    TransportSend(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("duplicate session: {0}")]
    DuplicateSession(String),

    #[error("transport already bound to a relay")]
    AlreadyBound,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
