use std::io;
use thiserror::Error;

/// Errors surfaced by the receiver's public API
#[derive(Debug, Error)]
pub enum RaopError {
    /// Receiver already running
    #[error("receiver already running")]
    AlreadyRunning,

    /// Listener could not bind any address family
    #[error("could not establish a service on port {port}")]
    BindFailed {
        /// The configured RTSP port
        port: u16,
    },

    /// Service advertisement failed
    #[error("advertisement error: {0}")]
    Advertisement(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] io::Error),
}

/// Result type alias for receiver operations
pub type Result<T> = std::result::Result<T, RaopError>;
