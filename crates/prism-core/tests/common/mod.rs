//! Test doubles and harness for the contract tests
//!
//! Provides a scripted DNS backend with call counters and failure
//! injection, a wire-level test client that speaks the framed protocol
//! with raw reads and writes (independent of the server's codec), and a
//! harness that runs a full server on an ephemeral loopback port.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;
use prism_core::traits::dns_backend::{DnsBackend, DnsBackendError, MemoryDnsBackend};
use prism_core::traits::token_verifier::StaticTokenVerifier;
use prism_core::{
    DnsReconciler, DnsSyncStatus, EventSender, HeartbeatMonitor, HostRegistry, MemoryRecordStore,
    PrismConfig, ReconcilerHandle, ServerEvent, ServerShared,
};

/// Zone used across the contract tests
pub const TEST_ZONE: &str = "prism.test";

/// A DNS backend that counts calls, can fail on demand, and can hold
/// upserts at a gate until the test releases them
pub struct ScriptedDnsBackend {
    inner: MemoryDnsBackend,
    upsert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    zone_calls: AtomicUsize,
    /// Errors popped one per upsert/delete call before the call proceeds
    fail_script: Mutex<VecDeque<DnsBackendError>>,
    /// When set, every upsert consumes one permit before executing
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedDnsBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryDnsBackend::new(),
            upsert_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            zone_calls: AtomicUsize::new(0),
            fail_script: Mutex::new(VecDeque::new()),
            gate: None,
        }
    }

    /// Restrict the backend to an explicit zone list
    pub fn with_zones(zones: Vec<String>) -> Self {
        Self {
            inner: MemoryDnsBackend::with_zones(zones),
            ..Self::new()
        }
    }

    /// Gate upserts behind a zero-permit semaphore; the test releases
    /// calls with `add_permits`
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::new()
        };
        (backend, gate)
    }

    /// Queue `count` copies of `error` to fail upcoming calls
    pub async fn fail_next(&self, error: DnsBackendError, count: usize) {
        let mut script = self.fail_script.lock().await;
        for _ in 0..count {
            script.push_back(error.clone());
        }
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn zone_calls(&self) -> usize {
        self.zone_calls.load(Ordering::SeqCst)
    }

    pub async fn lookup(&self, zone: &str, name: &str) -> Option<IpAddr> {
        self.inner.lookup(zone, name).await
    }

    pub async fn record_count(&self) -> usize {
        self.inner.len().await
    }

    async fn next_scripted_failure(&self) -> Option<DnsBackendError> {
        self.fail_script.lock().await.pop_front()
    }
}

impl Default for ScriptedDnsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsBackend for ScriptedDnsBackend {
    async fn upsert_a(
        &self,
        zone: &str,
        name: &str,
        ip: IpAddr,
    ) -> Result<String, DnsBackendError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| DnsBackendError::permanent("gate closed"))?;
            permit.forget();
        }
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.next_scripted_failure().await {
            return Err(error);
        }
        self.inner.upsert_a(zone, name, ip).await
    }

    async fn delete_a(&self, zone: &str, name: &str) -> Result<(), DnsBackendError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.next_scripted_failure().await {
            return Err(error);
        }
        self.inner.delete_a(zone, name).await
    }

    async fn zone_exists(&self, zone: &str) -> Result<bool, DnsBackendError> {
        self.zone_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.zone_exists(zone).await
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }
}

/// Server configuration tuned for fast tests
pub fn test_config() -> PrismConfig {
    let mut config = PrismConfig::default();
    config.bind_host = "127.0.0.1".to_string();
    config.max_connections = 32;
    config.auth_deadline_secs = 2;
    config.shutdown_grace_secs = 5;
    config.dns.zone = TEST_ZONE.to_string();
    config.dns.retry_base_ms = 10;
    config.dns.retry_cap_ms = 100;
    config
}

/// A full server on an ephemeral loopback port
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<HostRegistry>,
    pub backend: Arc<ScriptedDnsBackend>,
    pub store: Arc<MemoryRecordStore>,
    pub reconciler: Option<ReconcilerHandle>,
    pub events: mpsc::Receiver<ServerEvent>,
    pub cancel: CancellationToken,
    listener_task: tokio::task::JoinHandle<prism_core::Result<()>>,
    background: tokio::task::JoinSet<()>,
}

impl TestServer {
    /// Spawn the listener, monitor and reconciler with a scripted backend
    /// and a static verifier (`T1` -> `u1`, `T2` -> `u2`)
    pub async fn spawn(config: PrismConfig) -> Self {
        Self::spawn_with_backend(config, Arc::new(ScriptedDnsBackend::new())).await
    }

    pub async fn spawn_with_backend(config: PrismConfig, backend: Arc<ScriptedDnsBackend>) -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        let default_dns = if config.dns.enabled {
            DnsSyncStatus::Pending
        } else {
            DnsSyncStatus::Disabled
        };
        let registry = Arc::new(HostRegistry::new(
            Arc::clone(&store) as Arc<dyn prism_core::RecordStore>,
            default_dns,
        ));

        let verifier = Arc::new(
            StaticTokenVerifier::default()
                .with_token("T1", "u1")
                .with_token("T2", "u2"),
        );

        let (events, event_rx) = EventSender::channel(256);
        let cancel = CancellationToken::new();
        let mut background = tokio::task::JoinSet::new();

        let reconciler = if config.dns.enabled {
            let (reconciler, handle) = DnsReconciler::new(
                Arc::clone(&registry),
                Arc::clone(&backend) as Arc<dyn DnsBackend>,
                config.dns.clone(),
                events.clone(),
                cancel.child_token(),
            );
            background.spawn(reconciler.run());
            Some(handle)
        } else {
            None
        };

        let monitor = HeartbeatMonitor::new(
            Arc::clone(&registry),
            reconciler.clone(),
            config.heartbeat.clone(),
            config.dns.on_offline,
            events.clone(),
            cancel.child_token(),
        );
        background.spawn(monitor.run());

        let listener = tokio::net::TcpListener::bind((config.bind_host.as_str(), 0))
            .await
            .expect("ephemeral bind succeeds");
        let addr = listener.local_addr().expect("local addr");

        let shared = Arc::new(ServerShared {
            config,
            registry: Arc::clone(&registry),
            verifier,
            reconciler: reconciler.clone(),
            events,
        });
        let listener_cancel = cancel.clone();
        let listener_task =
            tokio::spawn(async move { prism_core::serve(listener, shared, listener_cancel).await });

        Self {
            addr,
            registry,
            backend,
            store,
            reconciler,
            events: event_rx,
            cancel,
            listener_task,
            background,
        }
    }

    /// Wait (bounded) for an event matching the predicate, discarding
    /// everything before it
    pub async fn wait_for_event<F>(&mut self, timeout: Duration, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("timed out waiting for event");
            let event = tokio::time::timeout(remaining, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Cancel everything and wait for the listener and background tasks
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.listener_task)
            .await
            .expect("listener drains within the grace period")
            .expect("listener task completes")
            .expect("listener exits cleanly");
        while self.background.join_next().await.is_some() {}
    }
}

/// Wire-level client speaking the framed protocol with raw socket I/O
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect succeeds");
        Self { stream }
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Write one frame, tolerating a server-side close mid-write
    pub async fn send_json_lossy(&mut self, value: &serde_json::Value) {
        let body = serde_json::to_vec(value).expect("serialize frame body");
        self.send_raw_lossy(&(body.len() as u32).to_be_bytes()).await;
        self.send_raw_lossy(&body).await;
    }

    /// Write one frame: 4-byte big-endian length, then the JSON body
    pub async fn send_json(&mut self, value: &serde_json::Value) {
        let body = serde_json::to_vec(value).expect("serialize frame body");
        self.send_raw(&(body.len() as u32).to_be_bytes()).await;
        self.send_raw(&body).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write succeeds");
    }

    /// Write that tolerates the server closing the socket mid-write
    pub async fn send_raw_lossy(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes).await;
    }

    /// Read one reply frame; `None` when the server closed the connection
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let mut prefix = [0u8; 4];
        match self.stream.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(_) => return None,
        }
        let len = u32::from_be_bytes(prefix) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.ok()?;
        Some(serde_json::from_slice(&body).expect("reply is valid JSON"))
    }

    /// Like `recv_json` but with a deadline
    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<serde_json::Value> {
        tokio::time::timeout(timeout, self.recv_json())
            .await
            .expect("timed out waiting for a reply")
    }

    /// Assert the server closes the connection without sending more data
    pub async fn expect_close(&mut self, timeout: Duration) {
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(timeout, self.stream.read(&mut byte))
            .await
            .expect("timed out waiting for close");
        match read {
            Ok(0) => {}
            Ok(n) => panic!("expected close, server sent {n} more bytes"),
            // Reset counts as closed
            Err(_) => {}
        }
    }

    /// Register and return the reply
    pub async fn register(
        &mut self,
        hostname: &str,
        client_ip: &str,
        token: Option<&str>,
    ) -> serde_json::Value {
        let mut frame = serde_json::json!({
            "version": "1.0",
            "action": "register",
            "hostname": hostname,
            "client_ip": client_ip,
            "timestamp": "2025-01-01T00:00:00Z",
        });
        if let Some(token) = token {
            frame["auth_token"] = serde_json::Value::String(token.to_string());
        }
        self.send_json(&frame).await;
        self.recv_json_timeout(Duration::from_secs(5))
            .await
            .expect("server replies to register")
    }

    /// Heartbeat and return the reply
    pub async fn heartbeat(&mut self, hostname: &str) -> serde_json::Value {
        self.send_json(&serde_json::json!({
            "version": "1.0",
            "action": "heartbeat",
            "hostname": hostname,
        }))
        .await;
        self.recv_json_timeout(Duration::from_secs(5))
            .await
            .expect("server replies to heartbeat")
    }
}

/// Shorthand for the `{"status":"ok"}` reply
pub fn ok_reply() -> serde_json::Value {
    serde_json::json!({"status": "ok"})
}

/// Shorthand for an error reply
pub fn error_reply(code: &str) -> serde_json::Value {
    serde_json::json!({"status": "error", "code": code})
}
