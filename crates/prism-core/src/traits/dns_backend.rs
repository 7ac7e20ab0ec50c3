//! DNS backend trait
//!
//! Record CRUD for one authoritative zone, keyed by `(zone, name)` with
//! the record type fixed to A or AAAA by IP family. Backends are untrusted
//! single-shot integrations: one API call per method, no retry or backoff
//! (the reconciler owns that), no caching, no background tasks.
//!
//! ## Implementations
//!
//! - PowerDNS HTTP API: `prism-dns-powerdns` crate
//! - In-memory fake: [`MemoryDnsBackend`] (tests and `dns.fallback_to_mock`)

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Backend failures, split by whether a retry can help
///
/// Network errors, timeouts and 5xx responses are retryable; 4xx responses
/// are permanent until a new intent arrives.
#[derive(Error, Debug, Clone)]
pub enum DnsBackendError {
    #[error("retryable backend failure: {0}")]
    Retryable(String),

    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl DnsBackendError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Trait for DNS backend implementations
///
/// # Idempotency
///
/// `upsert_a` must be idempotent: upserting the same `(zone, name, ip)`
/// twice is observationally identical to once, and a retried successful
/// upsert must not multiply records. `delete_a` of an absent record is Ok.
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Create or replace the address record for `name` in `zone`
    ///
    /// # Returns
    ///
    /// The backend-assigned record id on success.
    async fn upsert_a(&self, zone: &str, name: &str, ip: IpAddr)
    -> Result<String, DnsBackendError>;

    /// Remove the address record for `name` in `zone`
    async fn delete_a(&self, zone: &str, name: &str) -> Result<(), DnsBackendError>;

    /// Whether `zone` exists on the backend
    async fn zone_exists(&self, zone: &str) -> Result<bool, DnsBackendError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// In-memory DNS backend
///
/// Holds records in a map keyed by `(zone, name)`. Zones are implicit:
/// every zone exists unless the backend was built with an explicit zone
/// list. Safe to clone; clones share the same record table.
#[derive(Debug, Clone, Default)]
pub struct MemoryDnsBackend {
    records: Arc<RwLock<HashMap<(String, String), IpAddr>>>,
    zones: Option<Arc<Vec<String>>>,
}

impl MemoryDnsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the backend to an explicit zone list
    pub fn with_zones(zones: Vec<String>) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            zones: Some(Arc::new(zones)),
        }
    }

    /// Current record content, if any
    pub async fn lookup(&self, zone: &str, name: &str) -> Option<IpAddr> {
        let records = self.records.read().await;
        records.get(&(zone.to_string(), name.to_string())).copied()
    }

    /// Number of records held
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn record_id(zone: &str, name: &str, ip: IpAddr) -> String {
    let rtype = if ip.is_ipv4() { "A" } else { "AAAA" };
    format!("{name}.{zone}./{rtype}")
}

#[async_trait]
impl DnsBackend for MemoryDnsBackend {
    async fn upsert_a(
        &self,
        zone: &str,
        name: &str,
        ip: IpAddr,
    ) -> Result<String, DnsBackendError> {
        let mut records = self.records.write().await;
        records.insert((zone.to_string(), name.to_string()), ip);
        Ok(record_id(zone, name, ip))
    }

    async fn delete_a(&self, zone: &str, name: &str) -> Result<(), DnsBackendError> {
        let mut records = self.records.write().await;
        records.remove(&(zone.to_string(), name.to_string()));
        Ok(())
    }

    async fn zone_exists(&self, zone: &str) -> Result<bool, DnsBackendError> {
        match &self.zones {
            Some(zones) => Ok(zones.iter().any(|z| z == zone)),
            None => Ok(true),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
