//! DNS reconciler
//!
//! Consumes a queue of per-hostname intents (`upsert` or `delete`) and
//! applies them to the DNS backend. Intents for one hostname are
//! serialised: while one is in flight, later arrivals for the same name
//! collapse into a single pending slot where the newest intent supersedes
//! the rest. Intents for distinct hostnames run in parallel up to a
//! bounded worker count.
//!
//! Retryable backend failures are retried with exponential backoff (base
//! 1 s, cap 5 min, 6 attempts by default); permanent failures and missing
//! zones latch `dns_sync_status = failed` until a new intent arrives. A
//! gradual-rollout gate (stable hostname hash vs. a percentage) can keep a
//! host out of reconciliation entirely, leaving it `disabled`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DnsConfig;
use crate::event::{EventSender, ServerEvent};
use crate::registry::{stable_hash, DnsState, DnsSyncStatus, HostRegistry};
use crate::traits::dns_backend::DnsBackend;

/// What a queued intent wants done with a hostname's DNS record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Upsert,
    Delete,
}

/// A queued desire to reconcile one hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub hostname: String,
    pub kind: IntentKind,
}

impl Intent {
    pub fn upsert(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kind: IntentKind::Upsert,
        }
    }

    pub fn delete(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kind: IntentKind::Delete,
        }
    }
}

/// Cloneable submission handle for the reconciler queue
#[derive(Debug, Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<Intent>,
}

impl ReconcilerHandle {
    /// Enqueue an intent without blocking
    ///
    /// A full queue drops the intent with a warning; the next ingest or
    /// monitor pass for the hostname will queue a fresh one.
    pub fn submit(&self, intent: Intent) {
        if let Err(e) = self.tx.try_send(intent) {
            warn!("reconcile queue full, dropping intent: {e}");
        }
    }
}

/// Shared context handed to reconcile workers
struct ReconcilerShared {
    registry: Arc<HostRegistry>,
    backend: Arc<dyn DnsBackend>,
    config: DnsConfig,
    events: EventSender,
    cancel: CancellationToken,
}

/// Background reconcile dispatcher
pub struct DnsReconciler {
    shared: Arc<ReconcilerShared>,
    rx: mpsc::Receiver<Intent>,
}

impl DnsReconciler {
    pub fn new(
        registry: Arc<HostRegistry>,
        backend: Arc<dyn DnsBackend>,
        config: DnsConfig,
        events: EventSender,
        cancel: CancellationToken,
    ) -> (Self, ReconcilerHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(ReconcilerShared {
            registry,
            backend,
            config,
            events,
            cancel,
        });
        (Self { shared, rx }, ReconcilerHandle { tx })
    }

    /// Run until cancelled or every submission handle is dropped
    pub async fn run(mut self) {
        let worker_limit = Arc::new(Semaphore::new(self.shared.config.worker_count));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();

        // Per-hostname serialisation state: at most one in-flight worker,
        // at most one pending (newest-wins) intent behind it.
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut pending: HashMap<String, IntentKind> = HashMap::new();
        let mut workers = JoinSet::new();

        info!(
            backend = self.shared.backend.backend_name(),
            workers = self.shared.config.worker_count,
            "DNS reconciler started"
        );

        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                maybe = self.rx.recv() => match maybe {
                    Some(intent) => {
                        if in_flight.contains(&intent.hostname) {
                            // Collapse: the newest intent supersedes anything queued
                            pending.insert(intent.hostname, intent.kind);
                        } else {
                            Self::dispatch(
                                &self.shared,
                                intent,
                                &mut in_flight,
                                &mut workers,
                                &worker_limit,
                                &done_tx,
                            );
                        }
                    }
                    None => break,
                },
                Some(hostname) = done_rx.recv() => {
                    in_flight.remove(&hostname);
                    if let Some(kind) = pending.remove(&hostname) {
                        Self::dispatch(
                            &self.shared,
                            Intent { hostname, kind },
                            &mut in_flight,
                            &mut workers,
                            &worker_limit,
                            &done_tx,
                        );
                    }
                }
            }
        }

        // Let in-flight workers finish their current unit of work
        while workers.join_next().await.is_some() {}
        debug!("DNS reconciler stopped");
    }

    fn dispatch(
        shared: &Arc<ReconcilerShared>,
        intent: Intent,
        in_flight: &mut HashSet<String>,
        workers: &mut JoinSet<()>,
        worker_limit: &Arc<Semaphore>,
        done_tx: &mpsc::UnboundedSender<String>,
    ) {
        in_flight.insert(intent.hostname.clone());
        let shared = Arc::clone(shared);
        let worker_limit = Arc::clone(worker_limit);
        let done_tx = done_tx.clone();

        workers.spawn(async move {
            let Ok(_permit) = worker_limit.acquire_owned().await else {
                return;
            };
            apply_intent(&shared, &intent.hostname, intent.kind).await;
            let _ = done_tx.send(intent.hostname);
        });
    }
}

/// Whether the rollout gate lets a hostname reconcile
fn rollout_engaged(hostname: &str, percentage: u8) -> bool {
    if percentage >= 100 {
        return true;
    }
    stable_hash(hostname) % 100 < u64::from(percentage)
}

/// Retry delay for the given attempt (1-based): doubles from `base`, capped
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    cap.min(base.saturating_mul(1u32 << shift))
}

/// Apply one intent: gate, zone check, backend call with retries, registry
/// write-back
async fn apply_intent(shared: &ReconcilerShared, hostname: &str, kind: IntentKind) {
    let config = &shared.config;

    if !rollout_engaged(hostname, config.feature_flag_percentage) {
        let updated = shared
            .registry
            .set_dns_state(
                hostname,
                DnsState {
                    status: DnsSyncStatus::Disabled,
                    zone: None,
                    record_id: None,
                },
            )
            .await;
        if updated {
            debug!(%hostname, "below rollout threshold, DNS sync disabled");
            shared.events.emit(ServerEvent::ReconcileSkipped {
                hostname: hostname.to_string(),
                reason: "below rollout threshold".to_string(),
            });
        }
        return;
    }

    let mut attempt = 0;
    loop {
        attempt += 1;

        // Re-read per attempt so retries publish the latest address
        let Some(record) = shared.registry.get(hostname).await else {
            debug!(%hostname, "record disappeared, dropping intent");
            shared.events.emit(ServerEvent::ReconcileSkipped {
                hostname: hostname.to_string(),
                reason: "record removed".to_string(),
            });
            return;
        };
        let zone = record
            .dns_zone
            .clone()
            .unwrap_or_else(|| config.zone.clone());

        if attempt == 1 {
            match shared.backend.zone_exists(&zone).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%hostname, %zone, "zone does not exist on backend");
                    fail(shared, hostname, kind, &zone, record.dns_record_id, "zone not found")
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(%hostname, %zone, "zone lookup failed: {e}");
                    fail(shared, hostname, kind, &zone, record.dns_record_id, &e.to_string())
                        .await;
                    return;
                }
            }
        }

        let result = match kind {
            IntentKind::Upsert => shared
                .backend
                .upsert_a(&zone, &record.hostname, record.current_ip)
                .await
                .map(Some),
            IntentKind::Delete => shared
                .backend
                .delete_a(&zone, &record.hostname)
                .await
                .map(|()| None),
        };

        match result {
            Ok(Some(record_id)) => {
                shared
                    .registry
                    .set_dns_state(
                        hostname,
                        DnsState {
                            status: DnsSyncStatus::Synced,
                            zone: Some(zone),
                            record_id: Some(record_id),
                        },
                    )
                    .await;
                debug!(%hostname, ip = %record.current_ip, "DNS record synced");
                shared.events.emit(ServerEvent::ReconcileApplied {
                    hostname: hostname.to_string(),
                    intent: kind,
                });
                return;
            }
            Ok(None) => {
                // Successful delete: back to pending with the linkage cleared
                shared
                    .registry
                    .set_dns_state(
                        hostname,
                        DnsState {
                            status: DnsSyncStatus::Pending,
                            zone: None,
                            record_id: None,
                        },
                    )
                    .await;
                debug!(%hostname, "DNS record deleted");
                shared.events.emit(ServerEvent::ReconcileApplied {
                    hostname: hostname.to_string(),
                    intent: kind,
                });
                return;
            }
            Err(e) if e.is_retryable() && attempt < config.retry_max_attempts => {
                warn!(%hostname, attempt, "reconcile attempt failed: {e}");
                shared
                    .registry
                    .set_dns_state(
                        hostname,
                        DnsState {
                            status: DnsSyncStatus::Failed,
                            zone: Some(zone),
                            record_id: record.dns_record_id,
                        },
                    )
                    .await;

                let delay = backoff_delay(attempt, config.retry_base(), config.retry_cap());
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                warn!(%hostname, attempt, "reconcile gave up: {e}");
                fail(shared, hostname, kind, &zone, record.dns_record_id, &e.to_string()).await;
                return;
            }
        }
    }
}

/// Latch a failed sync state and publish the failure
async fn fail(
    shared: &ReconcilerShared,
    hostname: &str,
    kind: IntentKind,
    zone: &str,
    record_id: Option<String>,
    error: &str,
) {
    shared
        .registry
        .set_dns_state(
            hostname,
            DnsState {
                status: DnsSyncStatus::Failed,
                zone: Some(zone.to_string()),
                record_id,
            },
        )
        .await;
    shared.events.emit(ServerEvent::ReconcileFailed {
        hostname: hostname.to_string(),
        intent: kind,
        error: error.to_string(),
    });
}
