// # prism-core
//
// Core library for the Prism managed-DNS registration service.
//
// ## Architecture Overview
//
// Agents on dynamic-IP hosts keep a long-lived TCP connection open and
// announce their hostname and observed address; this crate maintains the
// authoritative registry of who is reachable where and propagates those
// mappings into an authoritative DNS backend.
//
// ```text
// bytes ──▶ FrameCodec ──▶ ClientMessage ──▶ Connection (auth → ingest)
//                                                 │
//                                                 ▼
//                        HeartbeatMonitor ──▶ HostRegistry ◀── snapshots (REST collaborator)
//                                │                │
//                                └── intents ─────┤
//                                                 ▼
//                                          DnsReconciler ──▶ DnsBackend
// ```
//
// - **FrameCodec / messages**: length-prefixed JSON wire protocol
// - **TokenVerifier**: binds a connection to an owner identity
// - **HostRegistry**: the single shared-mutable store, sharded and durable
// - **Connection / serve**: per-socket state machine and accept loop
// - **HeartbeatMonitor**: moves stale hosts offline
// - **DnsReconciler**: converges DNS records with retry and rollout gating
// - **DnsBackend / RecordStore**: capability seams with in-memory fakes
//
// ## Design Principles
//
// 1. Capability contracts at the seams; implementations are pluggable
// 2. Client-caused faults answer once and close; infrastructure faults are
//    absorbed, recorded on the registry and retried
// 3. Every background activity observes one cancellation signal and exits
//    after its current unit of work

pub mod config;
pub mod error;
pub mod event;
pub mod hostname;
pub mod monitor;
pub mod proto;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod state;
pub mod traits;

// Re-export core types for convenience
pub use config::{AuthConfig, DnsBackendConfig, DnsConfig, HeartbeatConfig, OfflinePolicy, PrismConfig};
pub use error::{Error, Result};
pub use event::{EventSender, ServerEvent};
pub use monitor::HeartbeatMonitor;
pub use proto::{ClientMessage, ErrorCode, FrameCodec, ServerReply};
pub use reconciler::{DnsReconciler, Intent, IntentKind, ReconcilerHandle};
pub use registry::{DnsSyncStatus, HostRecord, HostRegistry, HostStatus};
pub use server::{serve, ServerShared};
pub use state::{FileRecordStore, MemoryRecordStore};
pub use traits::{DnsBackend, MemoryDnsBackend, RecordStore, StaticTokenVerifier, TokenVerifier};
