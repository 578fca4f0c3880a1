//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error
    #[error("TUN device error: {0}")]
    Tun(String),

    /// Overlay transport error (a send or connect on a live handle failed)
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed wire message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection not known to the session layer
    #[error("no connection for handle {0}")]
    UnknownConnection(u32),

    /// Refused to open a connection (self-connect, duplicate)
    #[error("connection refused: {0}")]
    Refused(String),

    /// Platform not supported
    #[error("platform not supported for this operation")]
    PlatformNotSupported,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
