//! Bridge error types

use std::io;

use culvert_proto::DecodeError;

/// Bridge result type
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge errors
///
/// Everything here renders as a human-readable string suitable for the UI
/// layer; no variant leaks channel internals.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not connected to backend")]
    NotConnected,

    #[error("Channel error: {0}")]
    Channel(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Message delivery timed out")]
    DeliveryTimeout,

    #[error("Message delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Transport switch failed: {0}")]
    TransportSwitch(String),

    #[error("{0} rate limit exceeded, please slow down")]
    RateLimited(&'static str),

    #[error("Backend process error: {0}")]
    Backend(String),

    #[error("Bridge has shut down")]
    Shutdown,
}
