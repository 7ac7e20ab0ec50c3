//! TCP listener
//!
//! Accepts sockets indefinitely and runs one [`Connection`] task per
//! socket. Admission is capped by `max_connections`: beyond the cap,
//! accepted sockets are dropped immediately with no bytes written. On
//! cancellation the loop stops accepting, every handler observes its
//! child token, and the listener waits for them to drain up to the
//! shutdown grace period before aborting what is left.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::ServerShared;
use crate::error::Error;

/// Accept connections until cancelled, then drain
pub async fn serve(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let admission = Arc::new(Semaphore::new(shared.config.max_connections));
    let mut handlers = JoinSet::new();

    info!(
        addr = %listener.local_addr()?,
        max_connections = shared.config.max_connections,
        "listening for agent connections"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };

                let Ok(permit) = Arc::clone(&admission).try_acquire_owned() else {
                    debug!(%peer, "connection limit reached, dropping socket");
                    drop(stream);
                    continue;
                };

                let shared = Arc::clone(&shared);
                let child = cancel.child_token();
                handlers.spawn(async move {
                    let _permit = permit;
                    debug!(%peer, "connection accepted");
                    if let Err(e) = Connection::new(stream, peer, shared, child).run().await {
                        debug!(%peer, "connection ended with error: {e}");
                    }
                });
            }
            // Reap finished handlers so the set does not grow unbounded
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    drain(handlers, shared.config.shutdown_grace()).await;
    info!("listener stopped");
    Ok(())
}

/// Wait for live handlers up to `grace`, then abort the stragglers
async fn drain(mut handlers: JoinSet<()>, grace: std::time::Duration) {
    if handlers.is_empty() {
        return;
    }

    debug!(live = handlers.len(), "waiting for connections to drain");
    let drained = tokio::time::timeout(grace, async {
        while handlers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = handlers.len(),
            "shutdown grace period exceeded, aborting connections"
        );
        handlers.abort_all();
        while handlers.join_next().await.is_some() {}
    }
}
