//! Message shapes carried inside frames
//!
//! Requests are tagged by `action`, replies by `status`. The `version`
//! field is advisory: unknown minor versions are accepted, an unknown
//! major version is rejected with `bad_request`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version spoken by this server
pub const PROTOCOL_VERSION: &str = "1.0";

/// Major version this server accepts
const SUPPORTED_MAJOR: &str = "1";

/// A request frame from an agent
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Standalone authentication frame
    Auth { auth_token: String },

    /// Announce a hostname and its observed address
    Register {
        hostname: String,
        #[serde(default)]
        client_ip: Option<String>,
        /// Agent-side clock, advisory only
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        /// Accepted here as an alternative to an explicit `auth` frame
        #[serde(default)]
        auth_token: Option<String>,
    },

    /// Liveness ping for an already-registered hostname
    Heartbeat {
        hostname: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Clean disconnect
    Goodbye,
}

/// A reply frame to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerReply {
    Ok,
    Error { code: ErrorCode },
}

impl ServerReply {
    pub fn ok() -> Self {
        Self::Ok
    }

    pub fn error(code: ErrorCode) -> Self {
        Self::Error { code }
    }
}

/// Error codes surfaced to agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    Forbidden,
    BadHostname,
    BadRequest,
    Internal,
}

/// Faults in an otherwise well-framed message; all map to `bad_request`
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(String),

    #[error("malformed or unknown message: {0}")]
    BadMessage(String),
}

/// Parse a decoded frame body into a [`ClientMessage`]
///
/// The version gate runs first so a major-version mismatch is reported as
/// such even when the rest of the message would parse.
pub fn parse_client_message(value: serde_json::Value) -> Result<ClientMessage, ProtocolViolation> {
    if let Some(version) = value.get("version").and_then(|v| v.as_str()) {
        let major = version.split('.').next().unwrap_or(version);
        if major != SUPPORTED_MAJOR {
            return Err(ProtocolViolation::UnsupportedVersion(version.to_string()));
        }
    }

    serde_json::from_value(value).map_err(|e| ProtocolViolation::BadMessage(e.to_string()))
}
