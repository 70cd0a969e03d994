//! Edge replica daemon: one wire front end, one replication consumer.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use pgwire_edge::server::{self, ServerContext};
use pgwire_edge::upstream::UpstreamPool;
use pgwire_edge::{Config, ListenConfig, LocalConfig, ReplicationConfig, UpstreamConfig};
use pgwire_edge::{SchemaCache, SqliteStore, replication};

#[derive(Parser, Debug)]
#[command(name = "pgwire-edge")]
#[command(about = "PostgreSQL wire-protocol edge read replica")]
#[command(version)]
struct Cli {
    /// Upstream primary host
    #[arg(long, env = "EDGE_UPSTREAM_HOST", default_value = "127.0.0.1")]
    upstream_host: String,

    /// Upstream primary port
    #[arg(long, env = "EDGE_UPSTREAM_PORT", default_value = "5432")]
    upstream_port: u16,

    /// Upstream role; needs REPLICATION privilege
    #[arg(long, env = "EDGE_UPSTREAM_USER", default_value = "postgres")]
    upstream_user: String,

    /// Upstream password
    #[arg(long, env = "EDGE_UPSTREAM_PASSWORD", default_value = "postgres")]
    upstream_password: String,

    /// Upstream database name
    #[arg(long, env = "EDGE_UPSTREAM_DB", default_value = "postgres")]
    upstream_db: String,

    /// Default schema on the primary
    #[arg(long, env = "EDGE_UPSTREAM_SCHEMA", default_value = "public")]
    upstream_schema: String,

    /// Path of the local SQLite database
    #[arg(long, env = "EDGE_LOCAL_PATH", default_value = "edge.db")]
    local_path: PathBuf,

    /// Publication name on the primary
    #[arg(long, env = "EDGE_PUBLICATION", default_value = "edge_pub")]
    publication: String,

    /// Logical replication slot name
    #[arg(long, env = "EDGE_SLOT", default_value = "edge_slot")]
    slot: String,

    /// Output plugin for the slot
    #[arg(long, env = "EDGE_PLUGIN", default_value = "pgoutput")]
    plugin: String,

    /// Create the slot at startup when it does not exist
    #[arg(
        long,
        env = "EDGE_CREATE_SLOT",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    create_slot: bool,

    /// Use a temporary slot (dropped by the server on disconnect)
    #[arg(long, env = "EDGE_TEMPORARY_SLOT")]
    temporary_slot: bool,

    /// Standby timeout in seconds; status updates go out at half this
    #[arg(long, env = "EDGE_STANDBY_TIMEOUT", default_value = "20")]
    standby_timeout_secs: u64,

    /// Drop and recreate the publication at startup
    #[arg(
        long,
        env = "EDGE_MANAGE_PUBLICATION",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    manage_publication: bool,

    /// Listen address for the wire front end
    #[arg(long, env = "EDGE_LISTEN", default_value = "127.0.0.1:5433")]
    listen: String,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            upstream: UpstreamConfig {
                host: self.upstream_host,
                port: self.upstream_port,
                user: self.upstream_user,
                password: self.upstream_password,
                dbname: self.upstream_db,
                schema: self.upstream_schema,
            },
            local: LocalConfig {
                path: self.local_path,
            },
            replication: ReplicationConfig {
                publication: self.publication,
                slot_name: self.slot,
                plugin: self.plugin,
                create_slot_if_not_exists: self.create_slot,
                temporary: self.temporary_slot,
                standby_timeout: Duration::from_secs(self.standby_timeout_secs),
                manage_publication: self.manage_publication,
                ..ReplicationConfig::default()
            },
            listen: ListenConfig { addr: self.listen },
        }
    }
}

/// Delay ladder for replication reconnects; resets after a session that
/// lived long enough to be called healthy.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const HEALTHY_SESSION: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = Cli::parse().into_config();

    let store = match SqliteStore::open(&cfg.local.path) {
        Ok(store) => store,
        Err(e) => {
            error!(path = %cfg.local.path.display(), "failed to open local store: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = store.init_position_table() {
        error!("failed to init position table: {e}");
        return ExitCode::FAILURE;
    }

    let cache = match store.catalog().and_then(|catalog| {
        SchemaCache::bootstrap(catalog.iter().map(|(n, s)| (n.as_str(), s.as_str())))
    }) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!("failed to bootstrap schema cache: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(tables = cache.table_count(), "schema cache loaded");

    let (ddl_tx, mut ddl_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let ctx = Arc::new(ServerContext {
        store: store.clone(),
        upstream: Arc::new(UpstreamPool::new(cfg.upstream.clone())),
        ddl_tx,
    });
    let listener = match TcpListener::bind(&cfg.listen.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %cfg.listen.addr, "failed to bind: {e}");
            return ExitCode::FAILURE;
        }
    };
    let front_end = tokio::spawn(server::serve(listener, ctx, stop_rx.clone()));

    // Ctrl-C flips the stop signal; both loops drain and exit.
    {
        let stop_tx = stop_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                let _ = stop_tx.send(true);
            }
        });
    }

    // Replication with reconnect. Transient failures retry with a growing
    // delay; anything else is fatal and the process exits non-zero.
    let mut delay = RECONNECT_BASE;
    let exit = loop {
        if *stop_rx.borrow() {
            break ExitCode::SUCCESS;
        }
        let session_start = Instant::now();
        match replication::run(&cfg, store.clone(), cache.clone(), &mut ddl_rx, stop_rx.clone())
            .await
        {
            Ok(()) => {
                if *stop_rx.borrow() {
                    break ExitCode::SUCCESS;
                }
                warn!("replication stream ended, reconnecting");
            }
            Err(e) if e.is_transient() => {
                warn!("replication failed, reconnecting in {delay:?}: {e}");
            }
            Err(e) => {
                error!("replication failed fatally: {e}");
                break ExitCode::FAILURE;
            }
        }
        if session_start.elapsed() >= HEALTHY_SESSION {
            delay = RECONNECT_BASE;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RECONNECT_CAP);
    };

    let _ = stop_tx.send(true);
    let _ = front_end.await;
    exit
}
