//! Heartbeat monitor
//!
//! A single background task that scans the registry every `check_interval`
//! and moves hosts whose last ingest predates the timeout threshold
//! (`heartbeat_interval × timeout_multiplier + grace_period`) to offline.
//! Each transition may enqueue a DNS intent, depending on the configured
//! offline policy.
//!
//! The scan takes shard-local transitions, so connection handlers keep
//! making progress while it runs. A backwards clock step skips the pass
//! instead of mass-offlining the registry. On shutdown the in-flight pass
//! completes before the task exits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HeartbeatConfig, OfflinePolicy};
use crate::event::{EventSender, ServerEvent};
use crate::reconciler::{Intent, ReconcilerHandle};
use crate::registry::HostRegistry;

/// Background liveness scanner
pub struct HeartbeatMonitor {
    registry: Arc<HostRegistry>,
    reconciler: Option<ReconcilerHandle>,
    config: HeartbeatConfig,
    on_offline: OfflinePolicy,
    events: EventSender,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<HostRegistry>,
        reconciler: Option<ReconcilerHandle>,
        config: HeartbeatConfig,
        on_offline: OfflinePolicy,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            reconciler,
            config,
            on_offline,
            events,
            cancel,
        }
    }

    /// Run until cancelled
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; an initial pass over a
        // freshly hydrated registry is harmless and catches hosts that
        // went stale while the server was down.
        let mut last_pass: Option<DateTime<Utc>> = None;

        info!(
            check_interval_secs = self.config.check_interval_secs,
            threshold_secs = self.config.timeout_threshold().as_secs(),
            "heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            if let Some(previous) = last_pass {
                if now < previous {
                    warn!("clock moved backwards, skipping liveness pass");
                    continue;
                }
            }
            last_pass = Some(now);

            self.pass(now).await;
        }

        debug!("heartbeat monitor stopped");
    }

    /// One scan: compute the threshold, transition stale hosts, enqueue
    /// DNS intents for the transitions
    async fn pass(&self, now: DateTime<Utc>) {
        let threshold =
            now - chrono::Duration::from_std(self.config.timeout_threshold()).unwrap_or_default();

        let stale = self.registry.mark_offline_if_stale(now, threshold).await;
        if stale.is_empty() {
            return;
        }

        info!(count = stale.len(), "hosts timed out, marked offline");
        for hostname in stale {
            self.events.emit(ServerEvent::HostOffline {
                hostname: hostname.clone(),
            });

            if self.on_offline == OfflinePolicy::Delete {
                if let Some(reconciler) = &self.reconciler {
                    reconciler.submit(Intent::delete(hostname));
                }
            }
        }
    }
}
