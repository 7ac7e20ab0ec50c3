//! Capability traits consumed by the core
//!
//! The core talks to the outside world through three narrow contracts: a
//! token verifier that binds a connection to an owner, a DNS backend that
//! publishes A/AAAA records, and a record store that makes host records
//! durable. Each has a real implementation in a plugin crate and an
//! in-memory one here.

pub mod dns_backend;
pub mod record_store;
pub mod token_verifier;

pub use dns_backend::{DnsBackend, DnsBackendError, MemoryDnsBackend};
pub use record_store::RecordStore;
pub use token_verifier::{StaticTokenVerifier, TokenVerifier, TokenVerifyError, VerifiedIdentity};
