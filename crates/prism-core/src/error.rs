//! Error types for the Prism registration engine
//!
//! Client-caused faults (framing, auth, ownership) and infrastructure
//! faults (storage, DNS backend) are separate variants so call sites that
//! retry can tell them apart.

use thiserror::Error;

use crate::proto::codec::FrameError;
use crate::traits::dns_backend::DnsBackendError;

/// Result type alias for Prism operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the registration engine
#[derive(Error, Debug)]
pub enum Error {
    /// Wire framing faults (length prefix, oversize, invalid JSON)
    #[error("protocol fault: {0}")]
    Protocol(#[from] FrameError),

    /// Authentication failures (invalid or inactive tokens, verifier outages)
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Registry rejections and storage failures surfaced past the registry
    #[error("registry error: {0}")]
    Registry(String),

    /// Durable record store errors
    #[error("record store error: {0}")]
    RecordStore(String),

    /// DNS backend errors (carries the retryable/permanent distinction)
    #[error("DNS backend error: {0}")]
    DnsBackend(#[from] DnsBackendError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-related errors
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a record store error
    pub fn record_store(msg: impl Into<String>) -> Self {
        Self::RecordStore(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
