//! PostgreSQL wire front end.
//!
//! Accepts client connections and serves the simple-query protocol: reads
//! run against the local store, mutations and DDL forward to the primary.
//! Each connection gets its own task; all of them share the store handle
//! and the upstream writer.

mod session;

pub use session::{QueryClass, SessionState, WriteKind, classify};

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::replication::DdlSender;
use crate::store::SqliteStore;
use crate::upstream::UpstreamWriter;

/// Shared state handed to every session.
pub struct ServerContext {
    pub store: SqliteStore,
    pub upstream: Arc<dyn UpstreamWriter>,
    /// Successfully forwarded DDL goes here for local application by the
    /// replication loop.
    pub ddl_tx: DdlSender,
}

/// Accept loop. Stops accepting when the stop signal fires; open sessions
/// end after their current reply.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "front end listening");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    info!("front end stopping");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {e}");
                        continue;
                    }
                };
                debug!(%peer, "client connected");
                let ctx = ctx.clone();
                let stop = stop_rx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session::handle(socket, peer, ctx, stop).await {
                        debug!(%peer, "session ended with error: {e}");
                    }
                });
            }
        }
    }
}
