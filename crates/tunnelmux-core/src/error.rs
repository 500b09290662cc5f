use thiserror::Error;

/// Errors produced by the tunnelmux protocol layer and its two roles.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer closed the stream, possibly in the middle of a frame.
    #[error("stream closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    /// The original destination of an intercepted connection is unknown.
    #[error("cannot resolve destination: {0}")]
    Destination(String),

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
