// # PowerDNS Backend
//
// DnsBackend implementation against the PowerDNS authoritative HTTP API.
//
// One HTTP request per call, full error propagation to the reconciler
// (which owns retries and backoff), no caching, no background tasks.
// Requests carry the `X-API-Key` header and a 5 second deadline; network
// failures and 5xx responses surface as retryable, other 4xx responses as
// permanent.
//
// ## API Reference
//
// - Get zone:      GET   `/api/v1/servers/{server_id}/zones/{zone}`
// - Patch rrsets:  PATCH `/api/v1/servers/{server_id}/zones/{zone}`
//   with `{"rrsets": [{"name": ..., "type": "A", "changetype":
//   "REPLACE" | "DELETE", "records": [...]}]}`
//
// Record names sent to PowerDNS are fully qualified and carry the
// trailing dot the API requires.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use prism_core::traits::dns_backend::{DnsBackend, DnsBackendError};

/// Request deadline for every API call
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// TTL published on managed records
const RECORD_TTL: u32 = 300;

/// PowerDNS-backed DNS record CRUD
pub struct PowerDnsBackend {
    api_url: String,
    /// Never logged
    api_key: String,
    server_id: String,
    client: reqwest::Client,
}

// The API key stays out of Debug output
impl std::fmt::Debug for PowerDnsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerDnsBackend")
            .field("api_url", &self.api_url)
            .field("api_key", &"<REDACTED>")
            .field("server_id", &self.server_id)
            .finish()
    }
}

/// One rrset change in a zone PATCH
#[derive(Debug, Serialize)]
struct RrSet {
    name: String,
    #[serde(rename = "type")]
    type_field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
    changetype: String,
    records: Vec<RecordContent>,
}

#[derive(Debug, Serialize)]
struct RecordContent {
    content: String,
    disabled: bool,
}

#[derive(Debug, Serialize)]
struct RrSetPatch {
    rrsets: Vec<RrSet>,
}

impl PowerDnsBackend {
    /// Create a backend client
    ///
    /// `api_url` is the server root (e.g. `http://127.0.0.1:8081`);
    /// `server_id` is almost always `localhost` on a stock install.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        server_id: impl Into<String>,
    ) -> Result<Self, prism_core::Error> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(prism_core::Error::config("PowerDNS API key cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| prism_core::Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            server_id: server_id.into(),
            client,
        })
    }

    fn zone_url(&self, zone: &str) -> String {
        format!(
            "{}/api/v1/servers/{}/zones/{}",
            self.api_url, self.server_id, zone
        )
    }

    /// Send one rrset patch for the zone
    async fn patch_zone(&self, zone: &str, patch: &RrSetPatch) -> Result<(), DnsBackendError> {
        let response = self
            .client
            .patch(self.zone_url(zone))
            .header("X-API-Key", &self.api_key)
            .json(patch)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }
}

/// Fully qualified record name under the zone, with the API's trailing dot
fn fqdn(name: &str, zone: &str) -> String {
    format!("{}.{}.", name, zone.trim_end_matches('.'))
}

/// Record type by IP family
fn record_type(ip: IpAddr) -> &'static str {
    if ip.is_ipv4() { "A" } else { "AAAA" }
}

/// Map a transport-level failure (connect, timeout, TLS) to retryable
fn transport_error(e: reqwest::Error) -> DnsBackendError {
    DnsBackendError::retryable(format!("PowerDNS request failed: {e}"))
}

/// Map an HTTP status to the retryable/permanent split
fn status_error(status: reqwest::StatusCode, body: &str) -> DnsBackendError {
    let detail = format!("PowerDNS returned {status}: {body}");
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        DnsBackendError::retryable(detail)
    } else {
        DnsBackendError::permanent(detail)
    }
}

#[async_trait]
impl DnsBackend for PowerDnsBackend {
    async fn upsert_a(
        &self,
        zone: &str,
        name: &str,
        ip: IpAddr,
    ) -> Result<String, DnsBackendError> {
        let record_name = fqdn(name, zone);
        let rtype = record_type(ip);

        let patch = RrSetPatch {
            rrsets: vec![RrSet {
                name: record_name.clone(),
                type_field: rtype.to_string(),
                ttl: Some(RECORD_TTL),
                changetype: "REPLACE".to_string(),
                records: vec![RecordContent {
                    content: ip.to_string(),
                    disabled: false,
                }],
            }],
        };

        self.patch_zone(zone, &patch).await?;
        tracing::debug!(record = %record_name, %ip, "record replaced");
        Ok(format!("{record_name}/{rtype}"))
    }

    async fn delete_a(&self, zone: &str, name: &str) -> Result<(), DnsBackendError> {
        let record_name = fqdn(name, zone);

        // The address family is unknown at delete time; drop both rrsets.
        // Deleting an absent rrset is a no-op on the API, which keeps this
        // idempotent.
        let patch = RrSetPatch {
            rrsets: ["A", "AAAA"]
                .into_iter()
                .map(|rtype| RrSet {
                    name: record_name.clone(),
                    type_field: rtype.to_string(),
                    ttl: None,
                    changetype: "DELETE".to_string(),
                    records: Vec::new(),
                })
                .collect(),
        };

        self.patch_zone(zone, &patch).await?;
        tracing::debug!(record = %record_name, "record deleted");
        Ok(())
    }

    async fn zone_exists(&self, zone: &str) -> Result<bool, DnsBackendError> {
        let response = self
            .client
            .get(self.zone_url(zone))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    fn backend_name(&self) -> &'static str {
        "powerdns"
    }
}
