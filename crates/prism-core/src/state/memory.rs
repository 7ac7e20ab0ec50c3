//! In-memory record store
//!
//! No persistence across restarts: after a crash every host re-registers
//! and re-converges. Suitable for tests and container deployments where
//! that first-connect churn is acceptable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Error;
use crate::registry::HostRecord;
use crate::traits::record_store::RecordStore;

/// In-memory record store implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<HashMap<String, HostRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted records
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Persisted view of one record (test inspection)
    pub async fn get(&self, hostname: &str) -> Option<HostRecord> {
        self.inner.read().await.get(hostname).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_all(&self) -> Result<Vec<HostRecord>, Error> {
        let map = self.inner.read().await;
        Ok(map.values().cloned().collect())
    }

    async fn put(&self, record: &HostRecord) -> Result<(), Error> {
        let mut map = self.inner.write().await;
        map.insert(record.hostname.clone(), record.clone());
        Ok(())
    }

    async fn flush_all(&self, records: &[HostRecord]) -> Result<(), Error> {
        let mut map = self.inner.write().await;
        map.clear();
        for record in records {
            map.insert(record.hostname.clone(), record.clone());
        }
        Ok(())
    }
}
