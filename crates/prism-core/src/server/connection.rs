//! Per-connection state machine
//!
//! ```text
//!   START ──accept──▶ AWAIT_AUTH ──valid token──▶ READY
//!                         │                        │
//!                     invalid/timeout           ingest msg
//!                         ▼                        │
//!                       CLOSED ◀──idle/error──────┘
//! ```
//!
//! The first frame must carry a token, either as an explicit `auth`
//! message or as an `auth_token` field on the first `register`. In READY
//! the accepted actions are `register`, `heartbeat` and `goodbye`; every
//! request frame gets exactly one reply, client-caused faults get a
//! single-shot error reply and close, and framing faults close without a
//! reply. A connection binds to at most one hostname for its lifetime.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ServerShared;
use crate::error::Error;
use crate::event::ServerEvent;
use crate::hostname;
use crate::proto::codec::{FrameCodec, FrameError};
use crate::proto::message::{
    parse_client_message, ClientMessage, ErrorCode, ServerReply,
};
use crate::reconciler::Intent;
use crate::registry::{HostStatus, RegistryError};

/// What arrived (or didn't) while waiting for the next frame
enum Inbound {
    Frame(serde_json::Value),
    /// Peer closed the socket
    Closed,
    /// Read deadline expired
    Deadline,
    /// Server shutdown; close without writing
    Cancelled,
    /// Framing fault; close without writing
    Fault(FrameError),
}

/// Whether the READY loop keeps going after a message
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// One accepted socket
pub(crate) struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
    bound_hostname: Option<String>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        shared: Arc<ServerShared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            peer,
            shared,
            cancel,
            bound_hostname: None,
        }
    }

    /// Drive the connection to completion
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        let Some((owner_id, first_register)) = self.authenticate().await? else {
            return Ok(());
        };
        debug!(peer = %self.peer, owner = %owner_id, "connection authenticated");

        if let Some(message) = first_register {
            if self.dispatch(&owner_id, message).await? == Flow::Close {
                return Ok(());
            }
        }

        self.ready_loop(&owner_id).await
    }

    /// AWAIT_AUTH: read and verify the first frame
    ///
    /// Returns the owner plus the first `register` (if the token rode on
    /// one) so it can be processed in READY, or `None` when the
    /// connection is already closed.
    async fn authenticate(&mut self) -> Result<Option<(String, Option<ClientMessage>)>, Error> {
        let deadline = self.shared.config.auth_deadline();

        let value = match self.next_frame(deadline).await {
            Inbound::Frame(value) => value,
            Inbound::Closed | Inbound::Cancelled => return Ok(None),
            Inbound::Deadline => {
                debug!(peer = %self.peer, "no auth frame before deadline");
                return Ok(None);
            }
            Inbound::Fault(e) => {
                debug!(peer = %self.peer, "framing fault during auth: {e}");
                return Ok(None);
            }
        };

        let message = match parse_client_message(value) {
            Ok(message) => message,
            Err(violation) => {
                debug!(peer = %self.peer, "protocol violation during auth: {violation}");
                self.send(ServerReply::error(ErrorCode::BadRequest)).await?;
                return Ok(None);
            }
        };

        let token = match &message {
            ClientMessage::Auth { auth_token } => Some(auth_token.clone()),
            ClientMessage::Register {
                auth_token: Some(token),
                ..
            } => Some(token.clone()),
            _ => None,
        };
        let first_register = match message {
            message @ ClientMessage::Register { .. } => Some(message),
            _ => None,
        };

        let Some(token) = token else {
            debug!(peer = %self.peer, "first frame carried no token");
            self.send(ServerReply::error(ErrorCode::AuthFailed)).await?;
            return Ok(None);
        };

        match self.shared.verifier.verify(&token).await {
            Ok(identity) if identity.active => {
                if first_register.is_none() {
                    self.send(ServerReply::ok()).await?;
                }
                Ok(Some((identity.owner_id, first_register)))
            }
            Ok(_) => {
                debug!(peer = %self.peer, "token belongs to an inactive account");
                self.send(ServerReply::error(ErrorCode::AuthFailed)).await?;
                Ok(None)
            }
            Err(e) => {
                // Transient verifier outages fail closed, same reply as a bad token
                warn!(peer = %self.peer, "token verification failed: {e}");
                self.send(ServerReply::error(ErrorCode::AuthFailed)).await?;
                Ok(None)
            }
        }
    }

    /// READY: one reply per frame until close, idle timeout or fault
    async fn ready_loop(&mut self, owner_id: &str) -> Result<(), Error> {
        let idle = self.shared.config.heartbeat.idle_deadline();

        loop {
            match self.next_frame(idle).await {
                Inbound::Frame(value) => {
                    let message = match parse_client_message(value) {
                        Ok(message) => message,
                        Err(violation) => {
                            debug!(peer = %self.peer, "protocol violation: {violation}");
                            self.send(ServerReply::error(ErrorCode::BadRequest)).await?;
                            return Ok(());
                        }
                    };
                    if self.dispatch(owner_id, message).await? == Flow::Close {
                        return Ok(());
                    }
                }
                Inbound::Closed => return Ok(()),
                Inbound::Cancelled => {
                    debug!(peer = %self.peer, "closing for shutdown");
                    return Ok(());
                }
                Inbound::Deadline => {
                    debug!(peer = %self.peer, "idle deadline reached");
                    return Ok(());
                }
                Inbound::Fault(e) => {
                    debug!(peer = %self.peer, "framing fault: {e}");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&mut self, owner_id: &str, message: ClientMessage) -> Result<Flow, Error> {
        match message {
            ClientMessage::Register {
                hostname,
                client_ip,
                timestamp,
                ..
            } => {
                if let Some(reported) = timestamp {
                    let drift = (Utc::now() - reported).num_seconds().abs();
                    if drift > 300 {
                        debug!(peer = %self.peer, drift_secs = drift, "agent clock is far off");
                    }
                }
                self.handle_register(owner_id, &hostname, client_ip.as_deref())
                    .await
            }
            ClientMessage::Heartbeat { hostname, .. } => {
                self.handle_heartbeat(owner_id, &hostname).await
            }
            ClientMessage::Goodbye => {
                // Status stays as is; the monitor decides later
                self.send(ServerReply::ok()).await?;
                Ok(Flow::Close)
            }
            ClientMessage::Auth { .. } => {
                // Auth is only valid as the first frame
                self.send(ServerReply::error(ErrorCode::BadRequest)).await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn handle_register(
        &mut self,
        owner_id: &str,
        raw_hostname: &str,
        client_ip: Option<&str>,
    ) -> Result<Flow, Error> {
        let canonical = match hostname::canonicalize(raw_hostname) {
            Ok(name) => name,
            Err(e) => {
                debug!(peer = %self.peer, hostname = raw_hostname, "rejected hostname: {e}");
                self.send(ServerReply::error(ErrorCode::BadHostname)).await?;
                return Ok(Flow::Close);
            }
        };

        if let Some(bound) = &self.bound_hostname {
            if *bound != canonical {
                debug!(peer = %self.peer, bound = %bound, requested = %canonical,
                    "register for a second hostname on one connection");
                self.send(ServerReply::error(ErrorCode::Forbidden)).await?;
                return Ok(Flow::Close);
            }
        }

        let ip = effective_ip(client_ip, self.peer.ip());

        match self
            .shared
            .registry
            .upsert_on_registration(&canonical, ip, owner_id, Utc::now())
            .await
        {
            Ok(applied) => {
                if self.bound_hostname.is_none() {
                    self.bound_hostname = Some(canonical.clone());
                }
                if applied.prior_status != Some(HostStatus::Online) {
                    self.shared.events.emit(ServerEvent::HostOnline {
                        hostname: canonical.clone(),
                    });
                }
                if applied.needs_reconcile() {
                    if let Some(reconciler) = &self.shared.reconciler {
                        reconciler.submit(Intent::upsert(canonical));
                    }
                }
                self.send(ServerReply::ok()).await?;
                Ok(Flow::Continue)
            }
            Err(RegistryError::OwnerMismatch) => {
                debug!(peer = %self.peer, hostname = %canonical, "hostname owned by another account");
                self.send(ServerReply::error(ErrorCode::Forbidden)).await?;
                Ok(Flow::Close)
            }
            Err(RegistryError::MalformedHostname(e)) => {
                debug!(peer = %self.peer, "rejected hostname: {e}");
                self.send(ServerReply::error(ErrorCode::BadHostname)).await?;
                Ok(Flow::Close)
            }
            Err(e @ (RegistryError::Storage(_) | RegistryError::Unknown)) => {
                error!(peer = %self.peer, hostname = %canonical, "registration failed: {e}");
                self.send(ServerReply::error(ErrorCode::Internal)).await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn handle_heartbeat(&mut self, owner_id: &str, raw_hostname: &str) -> Result<Flow, Error> {
        // A heartbeat only makes sense for the hostname this connection
        // registered; anything else (including a malformed name) is a
        // binding mismatch.
        let canonical = hostname::canonicalize(raw_hostname).ok();
        let matches_binding = matches!(
            (&canonical, &self.bound_hostname),
            (Some(name), Some(bound)) if name == bound
        );
        if !matches_binding {
            debug!(peer = %self.peer, hostname = raw_hostname, "heartbeat for unbound hostname");
            self.send(ServerReply::error(ErrorCode::Forbidden)).await?;
            return Ok(Flow::Close);
        }
        let canonical = canonical.unwrap_or_default();

        match self
            .shared
            .registry
            .touch(&canonical, owner_id, Utc::now())
            .await
        {
            Ok(touched) => {
                if touched.prior_status != HostStatus::Online {
                    // Revived by heartbeat; DNS may have been torn down
                    self.shared.events.emit(ServerEvent::HostOnline {
                        hostname: canonical.clone(),
                    });
                    if let Some(reconciler) = &self.shared.reconciler {
                        reconciler.submit(Intent::upsert(canonical));
                    }
                }
                self.send(ServerReply::ok()).await?;
                Ok(Flow::Continue)
            }
            Err(e @ (RegistryError::Unknown | RegistryError::OwnerMismatch)) => {
                debug!(peer = %self.peer, hostname = %canonical, "heartbeat rejected: {e}");
                self.send(ServerReply::error(ErrorCode::Forbidden)).await?;
                Ok(Flow::Close)
            }
            Err(e) => {
                error!(peer = %self.peer, hostname = %canonical, "heartbeat failed: {e}");
                self.send(ServerReply::error(ErrorCode::Internal)).await?;
                Ok(Flow::Close)
            }
        }
    }

    /// Wait for the next frame, a deadline, or cancellation
    async fn next_frame(&mut self, deadline: Duration) -> Inbound {
        tokio::select! {
            _ = self.cancel.cancelled() => Inbound::Cancelled,
            result = tokio::time::timeout(deadline, self.framed.next()) => match result {
                Err(_) => Inbound::Deadline,
                Ok(None) => Inbound::Closed,
                Ok(Some(Ok(value))) => Inbound::Frame(value),
                Ok(Some(Err(e))) => Inbound::Fault(e),
            },
        }
    }

    async fn send(&mut self, reply: ServerReply) -> Result<(), Error> {
        self.framed.send(reply).await.map_err(Error::from)
    }
}

/// Pick the address to record: the reported one if it is a syntactically
/// valid, non-loopback, non-unspecified literal, otherwise the socket peer
fn effective_ip(reported: Option<&str>, peer: IpAddr) -> IpAddr {
    match reported.and_then(|raw| raw.parse::<IpAddr>().ok()) {
        Some(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => peer,
    }
}
