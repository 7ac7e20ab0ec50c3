//! Server events
//!
//! The monitor and reconciler publish state changes on a bounded channel
//! for external observers (tests, operator tooling). Emission never
//! blocks: with no consumer events are discarded, and a full channel drops
//! the event with a warning rather than growing without bound.

use tokio::sync::mpsc;
use tracing::warn;

use crate::reconciler::IntentKind;

/// Notifications published by the background activities
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A host came online (created, re-registered, or revived by heartbeat)
    HostOnline { hostname: String },

    /// The monitor moved a stale host offline
    HostOffline { hostname: String },

    /// A reconcile intent was applied to the DNS backend
    ReconcileApplied {
        hostname: String,
        intent: IntentKind,
    },

    /// A reconcile intent gave up (permanent failure, missing zone, or
    /// retries exhausted)
    ReconcileFailed {
        hostname: String,
        intent: IntentKind,
        error: String,
    },

    /// A reconcile intent was skipped (rollout gate, vanished record)
    ReconcileSkipped { hostname: String, reason: String },
}

/// Cloneable sending half of the event channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ServerEvent>,
}

impl EventSender {
    /// Create an event channel with the given capacity
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Publish an event without blocking
    pub fn emit(&self, event: ServerEvent) {
        if self.tx.is_closed() {
            return;
        }
        if self.tx.try_send(event).is_err() {
            warn!("event channel full, dropping event");
        }
    }
}
