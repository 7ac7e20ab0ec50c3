//! Hostname canonicalisation and validation
//!
//! Hostnames are case-insensitive and DNS-label-constrained (RFC 1035):
//! ASCII letters, digits, hyphens and dots, 1-253 characters total, labels
//! of 1-63 characters that neither start nor end with a hyphen. The
//! canonical form is lowercase; original casing is not preserved.

use thiserror::Error;

/// Maximum total hostname length
const MAX_NAME_LEN: usize = 253;

/// Maximum length of a single label
const MAX_LABEL_LEN: usize = 63;

/// Reasons a hostname fails validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostnameError {
    #[error("hostname is empty")]
    Empty,

    #[error("hostname exceeds {MAX_NAME_LEN} characters")]
    TooLong,

    #[error("label '{0}' exceeds {MAX_LABEL_LEN} characters")]
    LabelTooLong(String),

    #[error("hostname has an empty label")]
    EmptyLabel,

    #[error("label contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("label '{0}' starts or ends with a hyphen")]
    HyphenAtLabelEdge(String),
}

/// Validate a hostname and return its canonical (lowercase) form
pub fn canonicalize(raw: &str) -> Result<String, HostnameError> {
    if raw.is_empty() {
        return Err(HostnameError::Empty);
    }
    if raw.len() > MAX_NAME_LEN {
        return Err(HostnameError::TooLong);
    }

    let name = raw.to_ascii_lowercase();

    for label in name.split('.') {
        if label.is_empty() {
            return Err(HostnameError::EmptyLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(HostnameError::LabelTooLong(label.to_string()));
        }
        if let Some(bad) = label
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '-')
        {
            return Err(HostnameError::InvalidCharacter(bad));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(HostnameError::HyphenAtLabelEdge(label.to_string()));
        }
    }

    Ok(name)
}
