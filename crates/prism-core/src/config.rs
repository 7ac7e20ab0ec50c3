//! Configuration types for the registration service

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrismConfig {
    /// Address both listeners bind
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port of the agent-facing TCP listener
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Port reserved for the query-side REST collaborator
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Listener admission cap; sockets beyond it are dropped unanswered
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds a connection may sit unauthenticated before close
    #[serde(default = "default_auth_deadline_secs")]
    pub auth_deadline_secs: u64,

    /// Seconds to wait for in-flight connections to drain at shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Record file path; records live in memory only when unset
    #[serde(default)]
    pub state_path: Option<String>,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl PrismConfig {
    pub fn new() -> Self {
        Self {
            bind_host: default_bind_host(),
            tcp_port: default_tcp_port(),
            api_port: default_api_port(),
            max_connections: default_max_connections(),
            auth_deadline_secs: default_auth_deadline_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            state_path: None,
            heartbeat: HeartbeatConfig::default(),
            dns: DnsConfig::default(),
            auth: AuthConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.bind_host.is_empty() {
            return Err(crate::Error::config("bind_host cannot be empty"));
        }
        if self.tcp_port == 0 {
            return Err(crate::Error::config("tcp_port must be non-zero"));
        }
        if self.tcp_port == self.api_port {
            return Err(crate::Error::config(
                "tcp_port and api_port cannot be the same port",
            ));
        }
        if self.max_connections == 0 {
            return Err(crate::Error::config("max_connections must be > 0"));
        }
        if self.auth_deadline_secs == 0 {
            return Err(crate::Error::config("auth_deadline_secs must be > 0"));
        }

        self.heartbeat.validate()?;
        self.dns.validate()?;
        self.auth.validate()?;
        Ok(())
    }

    pub fn auth_deadline(&self) -> Duration {
        Duration::from_secs(self.auth_deadline_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for PrismConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness timeout tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Cadence agents are expected to heartbeat at (seconds)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,

    /// Seconds between monitor scans
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Missed intervals tolerated before a host is considered stale
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: u32,

    /// Extra slack on top of the missed intervals (seconds)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_secs == 0 {
            return Err(crate::Error::config("heartbeat interval must be > 0"));
        }
        if self.check_interval_secs == 0 {
            return Err(crate::Error::config("heartbeat check_interval must be > 0"));
        }
        if self.timeout_multiplier == 0 {
            return Err(crate::Error::config(
                "heartbeat timeout_multiplier must be >= 1",
            ));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Staleness bound: `interval × multiplier + grace`
    pub fn timeout_threshold(&self) -> Duration {
        Duration::from_secs(
            self.interval_secs * u64::from(self.timeout_multiplier) + self.grace_period_secs,
        )
    }

    /// Per-connection read deadline: three expected heartbeats
    pub fn idle_deadline(&self) -> Duration {
        Duration::from_secs(self.interval_secs * 3)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            check_interval_secs: default_check_interval_secs(),
            timeout_multiplier: default_timeout_multiplier(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// What to do with a host's DNS record when the monitor moves it offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicy {
    /// Remove the record; the name stops resolving while the host is down
    Delete,
    /// Keep the record pointing at the last known address
    Retain,
}

/// DNS propagation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Master switch for the reconciler
    #[serde(default = "default_dns_enabled")]
    pub enabled: bool,

    /// Zone new records are published under
    #[serde(default)]
    pub zone: String,

    /// Gradual rollout: hosts hashing below this percentage reconcile
    #[serde(default = "default_feature_flag_percentage")]
    pub feature_flag_percentage: u8,

    /// Substitute an in-memory backend when the real one is unreachable
    /// at startup
    #[serde(default)]
    pub fallback_to_mock: bool,

    #[serde(default = "default_on_offline")]
    pub on_offline: OfflinePolicy,

    #[serde(default = "default_backend")]
    pub backend: DnsBackendConfig,

    /// Parallel reconcile workers (distinct hostnames only)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Intent queue capacity; intents beyond it are dropped with a warning
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts per intent before giving up on a retryable failure
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// First retry delay in milliseconds; doubles per attempt
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

impl DnsConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.enabled && self.zone.is_empty() {
            return Err(crate::Error::config("dns.zone is required when DNS is enabled"));
        }
        if self.feature_flag_percentage > 100 {
            return Err(crate::Error::config(
                "dns.feature_flag_percentage must be between 0 and 100",
            ));
        }
        if self.enabled && self.worker_count == 0 {
            return Err(crate::Error::config("dns.worker_count must be > 0"));
        }
        if self.enabled && self.retry_max_attempts == 0 {
            return Err(crate::Error::config("dns.retry_max_attempts must be >= 1"));
        }
        self.backend.validate()
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_millis(self.retry_cap_ms)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: default_dns_enabled(),
            zone: String::new(),
            feature_flag_percentage: default_feature_flag_percentage(),
            fallback_to_mock: false,
            on_offline: default_on_offline(),
            backend: default_backend(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
        }
    }
}

/// DNS backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsBackendConfig {
    /// PowerDNS authoritative API (`prism-dns-powerdns` crate)
    PowerDns {
        api_url: String,
        api_key: String,
        #[serde(default = "default_server_id")]
        server_id: String,
    },

    /// In-memory backend; records vanish with the process
    Memory,
}

impl DnsBackendConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            DnsBackendConfig::PowerDns { api_url, api_key, .. } => {
                if api_url.is_empty() {
                    return Err(crate::Error::config("dns backend api_url cannot be empty"));
                }
                if api_key.is_empty() {
                    return Err(crate::Error::config("dns backend api_key cannot be empty"));
                }
                Ok(())
            }
            DnsBackendConfig::Memory => Ok(()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DnsBackendConfig::PowerDns { .. } => "powerdns",
            DnsBackendConfig::Memory => "memory",
        }
    }
}

/// Token verifier selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Account-service endpoint (`prism-auth-http` crate)
    Http { verify_url: String },

    /// Fixed token table, `token -> owner_id`; dev and test deployments
    Static {
        #[serde(default)]
        tokens: HashMap<String, String>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::Static {
            tokens: HashMap::new(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            AuthConfig::Http { verify_url } => {
                if verify_url.is_empty() {
                    return Err(crate::Error::config("auth verify_url cannot be empty"));
                }
                Ok(())
            }
            AuthConfig::Static { .. } => Ok(()),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_tcp_port() -> u16 {
    8080
}

fn default_api_port() -> u16 {
    8081
}

fn default_max_connections() -> usize {
    1000
}

fn default_auth_deadline_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_timeout_multiplier() -> u32 {
    2
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_dns_enabled() -> bool {
    true
}

fn default_feature_flag_percentage() -> u8 {
    100
}

fn default_on_offline() -> OfflinePolicy {
    OfflinePolicy::Delete
}

fn default_backend() -> DnsBackendConfig {
    DnsBackendConfig::Memory
}

fn default_server_id() -> String {
    "localhost".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retry_max_attempts() -> u32 {
    6
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_cap_ms() -> u64 {
    300_000
}
