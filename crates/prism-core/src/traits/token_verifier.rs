//! Token verifier trait
//!
//! Maps an opaque bearer token to an owner identity. The core treats
//! verifier outages as fail-closed: the connection is rejected and nothing
//! is cached here. Verifiers that want caching do it internally.

use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

/// Identity resolved from a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Opaque account identity; owns every hostname it registers
    pub owner_id: String,
    /// Inactive identities are rejected like invalid tokens
    pub active: bool,
}

/// Verification failures
#[derive(Error, Debug)]
pub enum TokenVerifyError {
    /// The token is not recognised by the account service
    #[error("token was rejected")]
    InvalidToken,

    /// The account service could not be reached; callers must fail closed
    #[error("verifier unavailable: {0}")]
    Transient(String),
}

/// Trait for token verifier implementations
///
/// Implementations must be thread-safe and usable across async tasks.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a bearer token to an identity
    ///
    /// # Returns
    ///
    /// - `Ok(VerifiedIdentity)`: token resolved (check `active`)
    /// - `Err(TokenVerifyError::InvalidToken)`: token rejected
    /// - `Err(TokenVerifyError::Transient)`: verifier unreachable
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, TokenVerifyError>;
}

/// In-memory verifier backed by a fixed token table
///
/// Used for development deployments and tests; the production verifier
/// lives in the `prism-auth-http` crate.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
    inactive: HashSet<String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens,
            inactive: HashSet::new(),
        }
    }

    /// Add a token for an owner
    pub fn with_token(mut self, token: impl Into<String>, owner_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), owner_id.into());
        self
    }

    /// Mark an owner as deactivated; its tokens still resolve but fail auth
    pub fn deactivate(&mut self, owner_id: impl Into<String>) {
        self.inactive.insert(owner_id.into());
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, TokenVerifyError> {
        let owner_id = self
            .tokens
            .get(token)
            .cloned()
            .ok_or(TokenVerifyError::InvalidToken)?;
        let active = !self.inactive.contains(&owner_id);
        Ok(VerifiedIdentity { owner_id, active })
    }
}
