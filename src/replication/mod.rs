//! Logical-replication consumer.
//!
//! Owns the replication session against the primary: publication and slot
//! lifecycle, the streaming loop, and the apply pipeline that keeps the
//! local store in step. This module is the single writer for all
//! replication-driven state: user tables, the replay position, and the
//! schema cache. Client-initiated DDL reaches it through an out-of-band
//! channel so local mutation stays on one path.

mod stream;

pub use stream::{Phase, StreamLoop};

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{EdgeError, Result};
use crate::lsn::Lsn;
use crate::schema::SchemaCache;
use crate::store::{PositionKey, SqliteStore};
use crate::upstream::UpstreamConn;

/// SQLSTATE for "object already exists", returned by CREATE_REPLICATION_SLOT
/// when the slot survived a previous run.
const DUPLICATE_OBJECT: &str = "42710";

/// Raw DDL accepted by the primary, queued for local application.
pub type DdlSender = mpsc::UnboundedSender<String>;
pub type DdlReceiver = mpsc::UnboundedReceiver<String>;

/// Run one replication session to completion: connect, reconcile
/// publication and slot, then stream and apply until stopped or failed.
pub async fn run(
    cfg: &Config,
    store: SqliteStore,
    cache: Arc<SchemaCache>,
    ddl_rx: &mut DdlReceiver,
    stop_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut conn = UpstreamConn::connect(&cfg.upstream, true).await?;
    info!(
        host = %cfg.upstream.host,
        db = %cfg.upstream.dbname,
        "replication session established"
    );

    let publication = cfg.replication.publication.replace('\'', "''");

    if cfg.replication.manage_publication {
        // Fresh publication each startup: the published table set may have
        // changed. Destructive if anything else owns the publication, hence
        // the config gate.
        conn.simple_query(&format!(
            "DROP PUBLICATION IF EXISTS {}",
            cfg.replication.publication
        ))
        .await?;
        conn.simple_query(&format!(
            "CREATE PUBLICATION {} FOR ALL TABLES",
            cfg.replication.publication
        ))
        .await?;
        debug!(publication = %cfg.replication.publication, "publication recreated");
    }

    let key = PositionKey {
        source_db: cfg.upstream.dbname.clone(),
        plugin: cfg.replication.plugin.clone(),
        publication: cfg.replication.publication.clone(),
    };
    let persisted = store.position(&key)?;

    let consistent_point = if cfg.replication.create_slot_if_not_exists {
        create_slot(&mut conn, cfg).await?
    } else {
        None
    };

    // Resume from the persisted position; a fresh slot starts at its
    // consistent point.
    let start_lsn = persisted.or(consistent_point).unwrap_or(Lsn::ZERO);
    info!(%start_lsn, persisted = persisted.is_some(), "starting replication stream");

    conn.start_copy_both(&format!(
        "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
        cfg.replication.slot_name, start_lsn, publication
    ))
    .await?;

    StreamLoop::new(conn, store, cache, cfg, key, start_lsn, ddl_rx, stop_rx)
        .run()
        .await
}

/// Create the logical slot, tolerating one that already exists. Returns the
/// slot's consistent point when freshly created.
async fn create_slot(conn: &mut UpstreamConn, cfg: &Config) -> Result<Option<Lsn>> {
    let temporary = if cfg.replication.temporary {
        " TEMPORARY"
    } else {
        ""
    };
    let sql = format!(
        "CREATE_REPLICATION_SLOT {}{} LOGICAL {}",
        cfg.replication.slot_name, temporary, cfg.replication.plugin
    );

    match conn.simple_query(&sql).await {
        Ok(outcome) => {
            // Columns: slot_name, consistent_point, snapshot_name, output_plugin
            let point = outcome
                .columns
                .iter()
                .position(|c| c == "consistent_point")
                .and_then(|idx| outcome.rows.first().and_then(|row| row.get(idx).cloned().flatten()))
                .and_then(|raw| String::from_utf8(raw.to_vec()).ok())
                .and_then(|text| text.parse::<Lsn>().ok());
            debug!(slot = %cfg.replication.slot_name, ?point, "replication slot created");
            Ok(point)
        }
        Err(EdgeError::UpstreamExec(msg)) if msg.contains(DUPLICATE_OBJECT) => {
            debug!(slot = %cfg.replication.slot_name, "replication slot already exists");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
