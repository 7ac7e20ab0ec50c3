// # prismd - Prism Registration Daemon
//
// Thin integration layer over prism-core: reads configuration from
// environment variables, wires the registry, verifier, DNS backend,
// monitor and reconciler together, and runs the TCP listener until a
// shutdown signal arrives. All registration logic lives in prism-core.
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Sockets
// - `PRISM_BIND_HOST`: Bind address (default 0.0.0.0)
// - `PRISM_TCP_PORT`: Agent-facing TCP port (default 8080)
// - `PRISM_API_PORT`: Port reserved for the REST collaborator (default 8081)
// - `PRISM_MAX_CONNECTIONS`: Listener admission cap (default 1000)
//
// ### State
// - `PRISM_STATE_PATH`: Host record file; records are memory-only if unset
//
// ### Heartbeat
// - `PRISM_HEARTBEAT_INTERVAL`: Expected agent cadence in seconds (default 60)
// - `PRISM_HEARTBEAT_CHECK_INTERVAL`: Monitor scan interval (default 30)
// - `PRISM_HEARTBEAT_TIMEOUT_MULTIPLIER`: Missed intervals tolerated (default 2)
// - `PRISM_HEARTBEAT_GRACE_PERIOD`: Extra slack in seconds (default 30)
//
// ### DNS
// - `PRISM_DNS_ENABLED`: Master switch for the reconciler (default true)
// - `PRISM_DNS_ZONE`: Zone records are published under
// - `PRISM_DNS_BACKEND`: powerdns or memory (default memory)
// - `PRISM_DNS_API_URL` / `PRISM_DNS_API_KEY`: PowerDNS API endpoint
// - `PRISM_DNS_SERVER_ID`: PowerDNS server id (default localhost)
// - `PRISM_DNS_FEATURE_FLAG_PERCENTAGE`: Gradual rollout, 0-100 (default 100)
// - `PRISM_DNS_FALLBACK_TO_MOCK`: Use the in-memory backend when the real
//   one is unreachable at startup (default false)
// - `PRISM_DNS_ON_OFFLINE`: delete or retain (default delete)
//
// ### Auth
// - `PRISM_AUTH_VERIFIER`: http or static (default static)
// - `PRISM_AUTH_VERIFY_URL`: Account-service endpoint (http verifier)
// - `PRISM_AUTH_TOKENS`: Comma-separated token=owner pairs (static verifier)
//
// ### Logging
// - `PRISM_LOG_LEVEL`: trace, debug, info, warn or error (default info)
//
// ## Exit codes
//
// - 0: Clean shutdown
// - 1: Configuration error
// - 2: Bind failure

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use prism_core::traits::dns_backend::DnsBackend;
use prism_core::traits::record_store::RecordStore;
use prism_core::traits::token_verifier::TokenVerifier;
use prism_core::{
    AuthConfig, DnsBackendConfig, DnsReconciler, DnsSyncStatus, EventSender, FileRecordStore,
    HeartbeatMonitor, HostRegistry, MemoryDnsBackend, MemoryRecordStore, PrismConfig,
    ReconcilerHandle, ServerShared, StaticTokenVerifier,
};

/// Exit codes for the daemon
#[derive(Debug, Clone, Copy)]
enum PrismExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// The TCP listener could not bind
    BindFailure = 2,
}

impl From<PrismExitCode> for ExitCode {
    fn from(code: PrismExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Read one optional env var, parsed
fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{key} has an invalid value: {raw}")),
        Err(_) => Ok(None),
    }
}

/// Read one optional boolean env var (true/false/1/0/yes/no)
fn env_bool(key: &str) -> Result<Option<bool>> {
    match env::var(key) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => bail!("{key} must be a boolean, got: {raw}"),
        },
        Err(_) => Ok(None),
    }
}

/// Build the server configuration from environment variables
fn config_from_env() -> Result<PrismConfig> {
    let mut config = PrismConfig::default();

    if let Ok(host) = env::var("PRISM_BIND_HOST") {
        config.bind_host = host;
    }
    if let Some(port) = env_parse("PRISM_TCP_PORT")? {
        config.tcp_port = port;
    }
    if let Some(port) = env_parse("PRISM_API_PORT")? {
        config.api_port = port;
    }
    if let Some(max) = env_parse("PRISM_MAX_CONNECTIONS")? {
        config.max_connections = max;
    }
    config.state_path = env::var("PRISM_STATE_PATH").ok();

    if let Some(secs) = env_parse("PRISM_HEARTBEAT_INTERVAL")? {
        config.heartbeat.interval_secs = secs;
    }
    if let Some(secs) = env_parse("PRISM_HEARTBEAT_CHECK_INTERVAL")? {
        config.heartbeat.check_interval_secs = secs;
    }
    if let Some(mult) = env_parse("PRISM_HEARTBEAT_TIMEOUT_MULTIPLIER")? {
        config.heartbeat.timeout_multiplier = mult;
    }
    if let Some(secs) = env_parse("PRISM_HEARTBEAT_GRACE_PERIOD")? {
        config.heartbeat.grace_period_secs = secs;
    }

    if let Some(enabled) = env_bool("PRISM_DNS_ENABLED")? {
        config.dns.enabled = enabled;
    }
    if let Ok(zone) = env::var("PRISM_DNS_ZONE") {
        config.dns.zone = zone;
    }
    if let Some(pct) = env_parse("PRISM_DNS_FEATURE_FLAG_PERCENTAGE")? {
        config.dns.feature_flag_percentage = pct;
    }
    if let Some(fallback) = env_bool("PRISM_DNS_FALLBACK_TO_MOCK")? {
        config.dns.fallback_to_mock = fallback;
    }
    if let Ok(policy) = env::var("PRISM_DNS_ON_OFFLINE") {
        config.dns.on_offline = match policy.to_lowercase().as_str() {
            "delete" => prism_core::OfflinePolicy::Delete,
            "retain" => prism_core::OfflinePolicy::Retain,
            _ => bail!("PRISM_DNS_ON_OFFLINE must be delete or retain, got: {policy}"),
        };
    }

    let backend_type = env::var("PRISM_DNS_BACKEND").unwrap_or_else(|_| "memory".to_string());
    config.dns.backend = match backend_type.as_str() {
        "memory" => DnsBackendConfig::Memory,
        "powerdns" => DnsBackendConfig::PowerDns {
            api_url: env::var("PRISM_DNS_API_URL")
                .context("PRISM_DNS_API_URL is required when PRISM_DNS_BACKEND=powerdns")?,
            api_key: env::var("PRISM_DNS_API_KEY")
                .context("PRISM_DNS_API_KEY is required when PRISM_DNS_BACKEND=powerdns")?,
            server_id: env::var("PRISM_DNS_SERVER_ID").unwrap_or_else(|_| "localhost".to_string()),
        },
        _ => bail!("PRISM_DNS_BACKEND '{backend_type}' is not supported. Supported: powerdns, memory"),
    };

    let verifier_type = env::var("PRISM_AUTH_VERIFIER").unwrap_or_else(|_| "static".to_string());
    config.auth = match verifier_type.as_str() {
        "static" => {
            let mut tokens = HashMap::new();
            if let Ok(raw) = env::var("PRISM_AUTH_TOKENS") {
                for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let Some((token, owner)) = pair.split_once('=') else {
                        bail!("PRISM_AUTH_TOKENS entries must look like token=owner, got: {pair}");
                    };
                    tokens.insert(token.to_string(), owner.to_string());
                }
            }
            AuthConfig::Static { tokens }
        }
        "http" => AuthConfig::Http {
            verify_url: env::var("PRISM_AUTH_VERIFY_URL")
                .context("PRISM_AUTH_VERIFY_URL is required when PRISM_AUTH_VERIFIER=http")?,
        },
        _ => bail!("PRISM_AUTH_VERIFIER '{verifier_type}' is not supported. Supported: http, static"),
    };

    Ok(config)
}

fn main() -> ExitCode {
    let config = match config_from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return PrismExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {e}");
        return PrismExitCode::ConfigError.into();
    }

    let log_level = env::var("PRISM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            eprintln!(
                "PRISM_LOG_LEVEL '{other}' is not valid. Valid levels: trace, debug, info, warn, error"
            );
            return PrismExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
        return PrismExitCode::ConfigError.into();
    }

    info!("Starting prismd");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {e}");
            return PrismExitCode::ConfigError.into();
        }
    };

    rt.block_on(run_daemon(config)).into()
}

/// Wire the components together and run until a shutdown signal
async fn run_daemon(config: PrismConfig) -> PrismExitCode {
    // Record store
    let store: Arc<dyn RecordStore> = match &config.state_path {
        Some(path) => {
            info!(path = %path, "using file-backed record store");
            match FileRecordStore::new(path).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to open record store: {e}");
                    return PrismExitCode::ConfigError;
                }
            }
        }
        None => {
            warn!("PRISM_STATE_PATH not set, host records will not survive restart");
            Arc::new(MemoryRecordStore::new())
        }
    };

    // Registry hydration
    let default_dns_status = if config.dns.enabled {
        DnsSyncStatus::Pending
    } else {
        DnsSyncStatus::Disabled
    };
    let registry = Arc::new(HostRegistry::new(store, default_dns_status));
    match registry.load().await {
        Ok(count) => info!(records = count, "registry hydrated"),
        Err(e) => {
            error!("Failed to hydrate registry: {e}");
            return PrismExitCode::ConfigError;
        }
    }

    // Bind before spawning anything so a bad address fails fast
    let listener =
        match tokio::net::TcpListener::bind((config.bind_host.as_str(), config.tcp_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    host = %config.bind_host,
                    port = config.tcp_port,
                    "Failed to bind TCP listener: {e}"
                );
                return PrismExitCode::BindFailure;
            }
        };

    let verifier: Arc<dyn TokenVerifier> = match build_verifier(&config) {
        Ok(verifier) => verifier,
        Err(e) => {
            error!("Failed to build token verifier: {e}");
            return PrismExitCode::ConfigError;
        }
    };

    // No in-process consumer; EventSender::emit is a no-op once the
    // receiver is gone, and every event is already traced at its source
    let (events, event_rx) = EventSender::channel(1024);
    drop(event_rx);
    let cancel = CancellationToken::new();
    let mut background = tokio::task::JoinSet::new();

    // DNS reconciler
    let reconciler_handle: Option<ReconcilerHandle> = if config.dns.enabled {
        let backend = match build_dns_backend(&config).await {
            Ok(backend) => backend,
            Err(e) => {
                error!("Failed to build DNS backend: {e}");
                return PrismExitCode::ConfigError;
            }
        };
        info!(backend = backend.backend_name(), zone = %config.dns.zone, "DNS propagation enabled");

        let (reconciler, handle) = DnsReconciler::new(
            Arc::clone(&registry),
            backend,
            config.dns.clone(),
            events.clone(),
            cancel.child_token(),
        );
        background.spawn(reconciler.run());
        Some(handle)
    } else {
        info!("DNS propagation disabled");
        None
    };

    // Heartbeat monitor
    let monitor = HeartbeatMonitor::new(
        Arc::clone(&registry),
        reconciler_handle.clone(),
        config.heartbeat.clone(),
        config.dns.on_offline,
        events.clone(),
        cancel.child_token(),
    );
    background.spawn(monitor.run());

    // TCP listener
    let shared = Arc::new(ServerShared {
        config: config.clone(),
        registry: Arc::clone(&registry),
        verifier,
        reconciler: reconciler_handle,
        events,
    });
    let listener_cancel = cancel.clone();
    let mut listener_task = tokio::spawn(async move {
        prism_core::serve(listener, shared, listener_cancel).await
    });

    // Run until a signal arrives or the listener dies on its own
    let listener_finished = tokio::select! {
        signal = wait_for_shutdown() => {
            match signal {
                Ok(name) => info!("Received {name}, shutting down"),
                Err(e) => error!("Signal handler error: {e}"),
            }
            false
        }
        result = &mut listener_task => {
            match result {
                Ok(Ok(())) => warn!("Listener exited unexpectedly"),
                Ok(Err(e)) => error!("Listener failed: {e}"),
                Err(e) => error!("Listener task panicked: {e}"),
            }
            true
        }
    };

    cancel.cancel();

    if !listener_finished {
        match tokio::time::timeout(config.shutdown_grace(), &mut listener_task).await {
            Ok(Ok(Err(e))) => error!("Listener shutdown error: {e}"),
            Ok(_) => {}
            Err(_) => {
                warn!("Listener did not drain in time, aborting");
                listener_task.abort();
            }
        }
    }
    while background.join_next().await.is_some() {}

    if let Err(e) = registry.flush().await {
        error!("Failed to flush registry state: {e}");
    } else {
        info!("Registry state flushed");
    }

    info!("Shutdown complete");
    PrismExitCode::CleanShutdown
}

fn build_verifier(config: &PrismConfig) -> Result<Arc<dyn TokenVerifier>> {
    match &config.auth {
        AuthConfig::Static { tokens } => {
            if tokens.is_empty() {
                warn!("static token table is empty, every connection will fail auth");
            }
            Ok(Arc::new(StaticTokenVerifier::new(tokens.clone())))
        }
        #[cfg(feature = "http-auth")]
        AuthConfig::Http { verify_url } => Ok(Arc::new(
            prism_auth_http::HttpTokenVerifier::new(verify_url.clone())?,
        )),
        #[cfg(not(feature = "http-auth"))]
        AuthConfig::Http { .. } => {
            bail!("prismd was built without the http-auth feature")
        }
    }
}

async fn build_dns_backend(config: &PrismConfig) -> Result<Arc<dyn DnsBackend>> {
    match &config.dns.backend {
        DnsBackendConfig::Memory => Ok(Arc::new(MemoryDnsBackend::new())),
        #[cfg(feature = "powerdns")]
        DnsBackendConfig::PowerDns {
            api_url,
            api_key,
            server_id,
        } => {
            let backend = prism_dns_powerdns::PowerDnsBackend::new(
                api_url.clone(),
                api_key.clone(),
                server_id.clone(),
            )?;

            // Startup probe; optionally degrade to the in-memory backend
            match backend.zone_exists(&config.dns.zone).await {
                Ok(true) => Ok(Arc::new(backend)),
                Ok(false) => {
                    warn!(zone = %config.dns.zone, "zone not present on PowerDNS backend");
                    Ok(Arc::new(backend))
                }
                Err(e) if config.dns.fallback_to_mock => {
                    warn!("PowerDNS unreachable at startup ({e}), falling back to in-memory backend");
                    Ok(Arc::new(MemoryDnsBackend::new()))
                }
                Err(e) => {
                    warn!("PowerDNS unreachable at startup ({e}), reconciler will retry");
                    Ok(Arc::new(backend))
                }
            }
        }
        #[cfg(not(feature = "powerdns"))]
        DnsBackendConfig::PowerDns { .. } => {
            bail!("prismd was built without the powerdns feature")
        }
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {e}"))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {e}"))?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

/// Wait for CTRL-C (non-Unix platforms)
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {e}"))?;
    Ok("SIGINT")
}
