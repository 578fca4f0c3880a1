//! Core error types

use thiserror::Error;

use peerlan_network::NetworkError;

/// Bridge-level errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad subnet, netmask, or MTU arguments at start
    #[error("configuration error: {0}")]
    Config(String),

    /// Device or transport failure surfaced at start time
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// The allocator ran out of usable addresses in the subnet
    #[error("virtual address pool exhausted")]
    AddressPoolExhausted,

    /// `start` called while the bridge is not stopped
    #[error("bridge is already running")]
    AlreadyRunning,
}

/// Result type for bridge operations
pub type CoreResult<T> = Result<T, CoreError>;
