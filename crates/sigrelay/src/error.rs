use thiserror::Error;

/// Errors that can end a peer connection or the relay server.
#[derive(Error, Debug)]
pub enum RelayError {
    /// WebSocket transport error while reading or writing a frame.
    #[error("transport error: {0}")]
    Transport(String),
    /// No inbound frame arrived within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,
    /// A frame could not be written before the write deadline.
    #[error("write deadline exceeded")]
    WriteTimeout,
    /// The router task is no longer accepting events.
    #[error("router unavailable")]
    RouterUnavailable,
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<axum::Error> for RelayError {
    fn from(e: axum::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
