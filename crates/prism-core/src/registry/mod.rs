//! Host registry
//!
//! The one piece of shared mutable state in the server. Maps canonical
//! hostnames to [`HostRecord`]s and enforces the per-identity invariants:
//! hostnames are globally unique, `owner_id` and `first_seen` never change
//! after creation, and `status = online` implies a recent ingest.
//!
//! The map is sharded by an FNV-1a hash of the hostname; each shard is a
//! `tokio::sync::RwLock<HashMap>`, so operations on the same hostname are
//! linearizable and operations on different hostnames rarely contend. No
//! lock is ever held across an await on the store or a socket.
//!
//! Persistence is write-through for creations and state transitions;
//! heartbeat-only `last_seen` advances stay in memory until `flush`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::hostname;
use crate::traits::record_store::RecordStore;

/// Number of lock shards; power of two, sized for ~10^4 connections
const SHARD_COUNT: usize = 64;

/// Liveness of a registered host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
}

/// Convergence state of the host's DNS record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsSyncStatus {
    /// No reconcile has succeeded yet (or the record was deleted)
    Pending,
    /// The backend holds a record matching `current_ip` as of last reconcile
    Synced,
    /// The last reconcile attempt failed; see reconciler for retry rules
    Failed,
    /// Excluded by the gradual-rollout gate
    Disabled,
}

/// The authoritative entry for one hostname
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Canonical (lowercase) hostname, unique across the registry
    pub hostname: String,
    /// Last reported address
    pub current_ip: IpAddr,
    /// Account bound at creation; immutable
    pub owner_id: String,
    pub status: HostStatus,
    /// Set at creation; immutable
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub dns_sync_status: DnsSyncStatus,
    pub dns_zone: Option<String>,
    pub dns_record_id: Option<String>,
}

impl HostRecord {
    fn new(
        hostname: String,
        ip: IpAddr,
        owner_id: &str,
        now: DateTime<Utc>,
        dns_sync_status: DnsSyncStatus,
    ) -> Self {
        Self {
            hostname,
            current_ip: ip,
            owner_id: owner_id.to_string(),
            status: HostStatus::Online,
            first_seen: now,
            last_seen: now,
            dns_sync_status,
            dns_zone: None,
            dns_record_id: None,
        }
    }
}

/// Outcome of a successful registration upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Status before this ingest; `None` when the record was just created
    pub prior_status: Option<HostStatus>,
    pub ip_changed: bool,
}

impl Applied {
    /// Whether the caller should enqueue a DNS reconcile
    pub fn needs_reconcile(&self) -> bool {
        self.ip_changed || self.prior_status != Some(HostStatus::Online)
    }
}

/// Outcome of a successful heartbeat touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touched {
    pub prior_status: HostStatus,
}

/// Why a registry operation did not apply
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The hostname is registered to a different account
    #[error("hostname is owned by another account")]
    OwnerMismatch,

    #[error("malformed hostname: {0}")]
    MalformedHostname(#[from] hostname::HostnameError),

    /// Touch of a hostname with no record
    #[error("hostname is not registered")]
    Unknown,

    /// The durable store rejected the write
    #[error("record store unavailable: {0}")]
    Storage(String),
}

/// DNS linkage written back by the reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct DnsState {
    pub status: DnsSyncStatus,
    pub zone: Option<String>,
    pub record_id: Option<String>,
}

/// Sharded, persistent host record store
pub struct HostRegistry {
    shards: Vec<RwLock<HashMap<String, HostRecord>>>,
    store: Arc<dyn RecordStore>,
    /// Sync status stamped on new records (Disabled when DNS is off)
    default_dns_status: DnsSyncStatus,
}

/// Stable FNV-1a hash; used for shard selection and the rollout gate so
/// both stay consistent across restarts and platforms
pub(crate) fn stable_hash(name: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

impl HostRegistry {
    pub fn new(store: Arc<dyn RecordStore>, default_dns_status: DnsSyncStatus) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            store,
            default_dns_status,
        }
    }

    /// Hydrate the registry from the record store
    pub async fn load(&self) -> Result<usize, crate::Error> {
        let records = self.store.load_all().await?;
        let count = records.len();
        for record in records {
            let shard = self.shard(&record.hostname);
            let mut map = shard.write().await;
            map.insert(record.hostname.clone(), record);
        }
        debug!(records = count, "registry hydrated from store");
        Ok(count)
    }

    fn shard(&self, name: &str) -> &RwLock<HashMap<String, HostRecord>> {
        let index = (stable_hash(name) as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Apply a registration ingest
    ///
    /// Creates the record if absent (bound to `owner_id`, `status=online`).
    /// If present, the owner must match; the address and `last_seen` are
    /// updated and an offline record comes back online. The returned
    /// [`Applied`] tells the caller whether a DNS reconcile is warranted.
    pub async fn upsert_on_registration(
        &self,
        hostname: &str,
        ip: IpAddr,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Applied, RegistryError> {
        let name = hostname::canonicalize(hostname)?;
        let shard = self.shard(&name);

        let (applied, to_persist) = {
            let mut map = shard.write().await;
            match map.get_mut(&name) {
                None => {
                    let record =
                        HostRecord::new(name.clone(), ip, owner_id, now, self.default_dns_status);
                    let persist = record.clone();
                    map.insert(name.clone(), record);
                    (
                        Applied {
                            prior_status: None,
                            ip_changed: false,
                        },
                        Some(persist),
                    )
                }
                Some(existing) => {
                    if existing.owner_id != owner_id {
                        return Err(RegistryError::OwnerMismatch);
                    }
                    let prior = existing.status;
                    let ip_changed = existing.current_ip != ip;
                    existing.current_ip = ip;
                    existing.last_seen = now;
                    existing.status = HostStatus::Online;
                    let applied = Applied {
                        prior_status: Some(prior),
                        ip_changed,
                    };
                    // Only transitions are write-through; a plain refresh is not
                    let persist = (ip_changed || prior != HostStatus::Online)
                        .then(|| existing.clone());
                    (applied, persist)
                }
            }
        };

        if let Some(record) = to_persist {
            self.store
                .put(&record)
                .await
                .map_err(|e| RegistryError::Storage(e.to_string()))?;
        }
        Ok(applied)
    }

    /// Apply a heartbeat ingest: advance `last_seen`, no address change
    ///
    /// A heartbeat is an ingest, so a record the monitor already moved
    /// offline comes back online here; the caller sees the prior status
    /// and can reschedule a reconcile.
    pub async fn touch(
        &self,
        hostname: &str,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Touched, RegistryError> {
        let name = hostname::canonicalize(hostname)?;
        let shard = self.shard(&name);

        let (touched, to_persist) = {
            let mut map = shard.write().await;
            let record = map.get_mut(&name).ok_or(RegistryError::Unknown)?;
            if record.owner_id != owner_id {
                return Err(RegistryError::OwnerMismatch);
            }
            let prior = record.status;
            record.last_seen = now;
            record.status = HostStatus::Online;
            let persist = (prior != HostStatus::Online).then(|| record.clone());
            (Touched { prior_status: prior }, persist)
        };

        if let Some(record) = to_persist {
            self.store
                .put(&record)
                .await
                .map_err(|e| RegistryError::Storage(e.to_string()))?;
        }
        Ok(touched)
    }

    /// Atomically transition every online host whose `last_seen` is older
    /// than `threshold` to offline; returns the hostnames that changed
    ///
    /// Transitions are taken shard by shard so connection handlers are
    /// never blocked for the whole scan. Store failures here are logged
    /// and absorbed: the in-memory transition stands and the monitor keeps
    /// running.
    pub async fn mark_offline_if_stale(
        &self,
        _now: DateTime<Utc>,
        threshold: DateTime<Utc>,
    ) -> Vec<String> {
        let mut transitioned = Vec::new();

        for shard in &self.shards {
            let stale: Vec<HostRecord> = {
                let mut map = shard.write().await;
                let mut changed = Vec::new();
                for record in map.values_mut() {
                    if record.status == HostStatus::Online && record.last_seen < threshold {
                        record.status = HostStatus::Offline;
                        changed.push(record.clone());
                    }
                }
                changed
            };

            for record in stale {
                if let Err(e) = self.store.put(&record).await {
                    warn!(hostname = %record.hostname, "failed to persist offline transition: {e}");
                }
                transitioned.push(record.hostname);
            }
        }

        transitioned
    }

    /// Write back the reconciler's view of the DNS linkage
    ///
    /// Returns false if the record disappeared in the meantime.
    pub async fn set_dns_state(&self, hostname: &str, state: DnsState) -> bool {
        let shard = self.shard(hostname);
        let record = {
            let mut map = shard.write().await;
            match map.get_mut(hostname) {
                Some(record) => {
                    record.dns_sync_status = state.status;
                    record.dns_zone = state.zone;
                    record.dns_record_id = state.record_id;
                    record.clone()
                }
                None => return false,
            }
        };

        if let Err(e) = self.store.put(&record).await {
            warn!(hostname = %record.hostname, "failed to persist DNS state: {e}");
        }
        true
    }

    /// Current record for a hostname, if any
    pub async fn get(&self, hostname: &str) -> Option<HostRecord> {
        let Ok(name) = hostname::canonicalize(hostname) else {
            return None;
        };
        let shard = self.shard(&name);
        let map = shard.read().await;
        map.get(&name).cloned()
    }

    /// Read-only view of one owner's records, sorted by hostname
    pub async fn snapshot_for_owner(&self, owner_id: &str) -> Vec<HostRecord> {
        let mut records = Vec::new();
        for shard in &self.shards {
            let map = shard.read().await;
            records.extend(map.values().filter(|r| r.owner_id == owner_id).cloned());
        }
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        records
    }

    /// Read-only view of every record, sorted by hostname
    pub async fn snapshot_all(&self) -> Vec<HostRecord> {
        let mut records = Vec::new();
        for shard in &self.shards {
            let map = shard.read().await;
            records.extend(map.values().cloned());
        }
        records.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        records
    }

    /// Persist a full snapshot, capturing `last_seen` values that were not
    /// written through per heartbeat
    pub async fn flush(&self) -> Result<(), crate::Error> {
        let records = self.snapshot_all().await;
        self.store.flush_all(&records).await
    }
}
