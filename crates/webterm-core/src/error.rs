use thiserror::Error;

/// Errors produced by the webterm relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("channel id already registered: {0}")]
    DuplicateId(String),

    #[error("session already bound to channel: {0}")]
    AlreadyBound(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("outbound queue full: {0}")]
    BackpressureExceeded(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("remote dial failed: {0}")]
    RemoteDialFailure(String),

    #[error("remote shell error: {0}")]
    RemoteShellFailure(String),

    #[error("transport error: {0}")]
    TransportFailure(String),

    #[error("max sessions ({0}) reached")]
    SessionLimit(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
