// # HTTP Token Verifier
//
// TokenVerifier implementation that asks an HTTP account service whether
// a bearer token is valid and which owner it belongs to.
//
// One POST per verification, no caching here (the account service caches
// on its side), no retries (the connection handler fails closed on a
// transient error and the agent reconnects on its own schedule).
//
// ## Wire shape
//
// ```http
// POST {verify_url}
// Content-Type: application/json
//
// {"token": "<opaque>"}
// ```
//
// A 200 response carries `{"owner_id": "...", "active": true}`; 401/403/404
// mean the token is unknown. Anything else, including transport failures,
// is a transient verifier outage.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use prism_core::traits::token_verifier::{TokenVerifier, TokenVerifyError, VerifiedIdentity};

/// Request deadline for a verification call
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Account-service-backed token verifier
#[derive(Debug, Clone)]
pub struct HttpTokenVerifier {
    verify_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    owner_id: String,
    active: bool,
}

impl HttpTokenVerifier {
    pub fn new(verify_url: impl Into<String>) -> Result<Self, prism_core::Error> {
        let verify_url = verify_url.into();
        if verify_url.is_empty() {
            return Err(prism_core::Error::config("verify URL cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()
            .map_err(|e| prism_core::Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { verify_url, client })
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, TokenVerifyError> {
        let response = self
            .client
            .post(&self.verify_url)
            .json(&VerifyRequest { token })
            .send()
            .await
            .map_err(|e| TokenVerifyError::Transient(format!("account service unreachable: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let body: VerifyResponse = response.json().await.map_err(|e| {
                TokenVerifyError::Transient(format!("malformed verifier response: {e}"))
            })?;
            tracing::debug!(owner = %body.owner_id, active = body.active, "token resolved");
            return Ok(VerifiedIdentity {
                owner_id: body.owner_id,
                active: body.active,
            });
        }

        match status.as_u16() {
            401 | 403 | 404 => Err(TokenVerifyError::InvalidToken),
            _ => Err(TokenVerifyError::Transient(format!(
                "account service returned {status}"
            ))),
        }
    }
}
