//! Agent-facing TCP server
//!
//! [`listener`] owns the accept loop and connection admission;
//! [`connection`] runs the per-socket state machine. Both lean on the
//! shared context below, which bundles the registry, the auth and DNS
//! capabilities and the event channel.

pub mod connection;
pub mod listener;

use std::sync::Arc;

use crate::config::PrismConfig;
use crate::event::EventSender;
use crate::reconciler::ReconcilerHandle;
use crate::registry::HostRegistry;
use crate::traits::token_verifier::TokenVerifier;

pub use listener::serve;

/// Dependencies shared by every connection handler
pub struct ServerShared {
    pub config: PrismConfig,
    pub registry: Arc<HostRegistry>,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Absent when DNS propagation is disabled
    pub reconciler: Option<ReconcilerHandle>,
    pub events: EventSender,
}
