//! Record store trait
//!
//! Durable persistence for host records. The registry writes through this
//! seam on creation and state transitions only; heartbeats mutate memory
//! and are flushed in bulk at shutdown. The registry survives restart by
//! hydrating from `load_all`.

use async_trait::async_trait;

use crate::error::Error;
use crate::registry::HostRecord;

/// Trait for record store implementations
///
/// All methods must be safe to call concurrently from multiple tasks.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load every persisted record (startup hydration)
    async fn load_all(&self) -> Result<Vec<HostRecord>, Error>;

    /// Persist one record (create or replace by hostname)
    async fn put(&self, record: &HostRecord) -> Result<(), Error>;

    /// Replace the persisted set with a full snapshot
    ///
    /// Used at shutdown to capture `last_seen` values that were not worth
    /// a write per heartbeat.
    async fn flush_all(&self, records: &[HostRecord]) -> Result<(), Error>;
}
