//! Streaming loop and apply pipeline.
//!
//! Frames come off the replication socket, decode into change events, and
//! buffer between `Begin` and `Commit`. On commit the whole batch and the
//! new replay position go into the store in one transaction; the stream is
//! never acknowledged past the last committed position, so the primary
//! retains WAL until the replica has truly applied it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{EdgeError, Result};
use crate::lsn::Lsn;
use crate::protocol::framing::{read_backend_message, write_copy_data};
use crate::protocol::messages::parse_error_response;
use crate::protocol::pgoutput::{self, ChangeEvent, RelationDesc};
use crate::protocol::replication::{
    ReplicationCopyData, encode_standby_status_update, parse_copy_data, pg_epoch_micros,
};
use crate::schema::cache::AlterOp;
use crate::schema::SchemaCache;
use crate::sqlgen::{self, LocalDdl, LocalStatement, render_create_table};
use crate::store::{PositionKey, SqliteStore};
use crate::upstream::UpstreamConn;

use super::DdlReceiver;

/// Retry ceiling for a failing local batch. With the 100ms doubling base
/// this spans roughly half a minute before the stream aborts.
const MAX_APPLY_ATTEMPTS: u32 = 10;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Upper bound on a single socket wait, so stop signals and feedback
/// deadlines are noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// Replication session phases, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Handshaking,
    Streaming,
    Applying,
    Closing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Connecting => "connecting",
            Phase::Handshaking => "handshaking",
            Phase::Streaming => "streaming",
            Phase::Applying => "applying",
            Phase::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Bounded exponential backoff: base 100ms, doubling, capped at 10s.
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn exhausted(&self) -> bool {
        self.attempt >= MAX_APPLY_ATTEMPTS
    }

    fn next_delay(&mut self) -> Duration {
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(BACKOFF_CAP);
        self.attempt += 1;
        delay
    }
}

/// Outcome of absorbing one change event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Absorbed {
    /// Event buffered (or informational); nothing to do yet.
    Buffered,
    /// A Commit arrived; the pending batch is ready to apply at this LSN.
    CommitReady(Lsn),
}

/// Event semantics, separated from socket handling: relation tracking,
/// batch buffering, on-demand table creation, DDL application.
pub(crate) struct Applier {
    store: SqliteStore,
    cache: Arc<SchemaCache>,
    key: PositionKey,
    relations: HashMap<u32, RelationDesc>,
    pending: Vec<LocalStatement>,
    in_tx: bool,
}

impl Applier {
    pub(crate) fn new(store: SqliteStore, cache: Arc<SchemaCache>, key: PositionKey) -> Self {
        Self {
            store,
            cache,
            key,
            relations: HashMap::new(),
            pending: Vec::new(),
            in_tx: false,
        }
    }

    pub(crate) fn in_tx(&self) -> bool {
        self.in_tx
    }

    /// Fold one decoded event into the pending batch.
    pub(crate) fn absorb(&mut self, event: ChangeEvent) -> Result<Absorbed> {
        match event {
            ChangeEvent::Begin { final_lsn, xid, .. } => {
                trace!(%final_lsn, xid, "transaction begin");
                self.in_tx = true;
                self.pending.clear();
                Ok(Absorbed::Buffered)
            }
            ChangeEvent::Commit { commit_lsn, .. } => Ok(Absorbed::CommitReady(commit_lsn)),
            ChangeEvent::Relation(desc) => {
                trace!(oid = desc.oid, table = %desc.name, "relation descriptor");
                self.relations.insert(desc.oid, desc);
                Ok(Absorbed::Buffered)
            }
            ChangeEvent::Insert { rel_oid, new } => {
                let rel = self.relation(rel_oid)?.clone();
                let schema = self.ensure_table(&rel)?;
                self.pending.push(sqlgen::insert(&rel, &schema, &new)?);
                Ok(Absorbed::Buffered)
            }
            ChangeEvent::Update {
                rel_oid,
                old,
                key,
                new,
            } => {
                let rel = self.relation(rel_oid)?.clone();
                let schema = self.ensure_table(&rel)?;
                self.pending.push(sqlgen::update(
                    &rel,
                    &schema,
                    old.as_ref(),
                    key.as_ref(),
                    &new,
                )?);
                Ok(Absorbed::Buffered)
            }
            ChangeEvent::Delete { rel_oid, old } => {
                let rel = self.relation(rel_oid)?.clone();
                let schema = self.ensure_table(&rel)?;
                self.pending.push(sqlgen::delete(&rel, &schema, &old)?);
                Ok(Absorbed::Buffered)
            }
            ChangeEvent::Truncate { rel_oids, .. } => {
                for oid in rel_oids {
                    match self.relations.get(&oid) {
                        Some(rel) => self.pending.push(sqlgen::truncate(&rel.name)),
                        None => warn!(oid, "truncate for unknown relation, skipping"),
                    }
                }
                Ok(Absorbed::Buffered)
            }
            ChangeEvent::Origin { name, .. } => {
                trace!(origin = %name, "origin message");
                Ok(Absorbed::Buffered)
            }
            ChangeEvent::Type {
                oid,
                namespace,
                name,
            } => {
                trace!(oid, %namespace, %name, "type metadata");
                Ok(Absorbed::Buffered)
            }
        }
    }

    /// Apply the pending batch at the given commit LSN: one local
    /// transaction for the DML plus the position upsert. On success the
    /// batch is consumed; on failure it stays pending for retry.
    pub(crate) fn apply_pending(&mut self, commit_lsn: Lsn) -> Result<()> {
        self.store
            .apply_batch(&self.pending, &self.key, commit_lsn)?;
        debug!(%commit_lsn, statements = self.pending.len(), "batch applied");
        self.pending.clear();
        self.in_tx = false;
        Ok(())
    }

    /// Translate and apply one client-forwarded DDL statement, then mutate
    /// the schema cache to match.
    pub(crate) fn apply_ddl(&self, sql: &str) -> Result<()> {
        match sqlgen::rewrite_ddl(sql)? {
            LocalDdl::CreateTable { schema, sql } => {
                self.store.exec(&sql).map_err(EdgeError::into_apply)?;
                info!(table = %schema.name, "table created locally");
                self.cache.apply_create(schema);
            }
            LocalDdl::DropTable { table, sql } => {
                self.store.exec(&sql).map_err(EdgeError::into_apply)?;
                info!(%table, "table dropped locally");
                self.cache.apply_drop(&table);
            }
            LocalDdl::AddColumn { table, column, sql } => {
                self.store.exec(&sql).map_err(EdgeError::into_apply)?;
                self.cache
                    .apply_alter(&table, AlterOp::AddColumn(column))?;
            }
            LocalDdl::DropColumn { table, column, sql } => {
                self.store.exec(&sql).map_err(EdgeError::into_apply)?;
                self.cache
                    .apply_alter(&table, AlterOp::DropColumn(column))?;
            }
            LocalDdl::RenameColumn {
                table,
                from,
                to,
                sql,
            } => {
                self.store.exec(&sql).map_err(EdgeError::into_apply)?;
                self.cache
                    .apply_alter(&table, AlterOp::RenameColumn { from, to })?;
            }
            LocalDdl::ChangeColumnType {
                table,
                column,
                ty,
                modifier,
            } => {
                // The store is dynamically typed; only the cache needs to know.
                self.cache.apply_alter(
                    &table,
                    AlterOp::ChangeType {
                        column,
                        ty,
                        modifier,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn relation(&self, oid: u32) -> Result<&RelationDesc> {
        self.relations.get(&oid).ok_or_else(|| {
            EdgeError::Decode(format!("row event for unknown relation oid {oid}"))
        })
    }

    /// A relation streamed from the primary may not exist locally yet
    /// (created before this replica, or by another writer). Create it from
    /// the descriptor; `IF NOT EXISTS` makes a lost race harmless.
    fn ensure_table(&self, rel: &RelationDesc) -> Result<Arc<crate::schema::TableSchema>> {
        if let Some(schema) = self.cache.get(&rel.name) {
            return Ok(schema);
        }
        let schema = sqlgen::table_from_relation(rel)?;
        self.store
            .exec(&render_create_table(&schema))
            .map_err(EdgeError::into_apply)?;
        info!(table = %rel.name, "table created on demand from relation descriptor");
        self.cache.apply_create(schema);
        self.cache
            .get(&rel.name)
            .ok_or_else(|| EdgeError::LocalApply(format!("table {} vanished", rel.name)))
    }
}

/// The streaming loop: socket frames, feedback cadence, stop handling, and
/// retry policy around the [`Applier`].
pub struct StreamLoop<'a> {
    conn: UpstreamConn,
    applier: Applier,
    status_interval: Duration,
    idle_timeout: Duration,
    last_committed: Lsn,
    ddl_rx: &'a mut DdlReceiver,
    stop_rx: watch::Receiver<bool>,
    phase: Phase,
}

impl<'a> StreamLoop<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: UpstreamConn,
        store: SqliteStore,
        cache: Arc<SchemaCache>,
        cfg: &Config,
        key: PositionKey,
        start_lsn: Lsn,
        ddl_rx: &'a mut DdlReceiver,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            conn,
            applier: Applier::new(store, cache, key),
            // Feedback at least every StandbyTimeout/2.
            status_interval: cfg.replication.standby_timeout / 2,
            idle_timeout: cfg.replication.idle_timeout,
            last_committed: start_lsn,
            ddl_rx,
            stop_rx,
            phase: Phase::Streaming,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(from = %self.phase, to = %phase, "phase transition");
            self.phase = phase;
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut last_status = Instant::now() - self.status_interval;
        let mut last_server = Instant::now();

        loop {
            self.drain_ddl();

            // Finish the in-flight transaction before honoring a stop.
            if *self.stop_rx.borrow() && !self.applier.in_tx() {
                return self.finish().await;
            }

            if last_status.elapsed() >= self.status_interval {
                self.send_feedback(false).await?;
                last_status = Instant::now();
            }

            let wait = self
                .status_interval
                .saturating_sub(last_status.elapsed())
                .min(POLL_SLICE);
            let msg = match timeout(wait, read_backend_message(self.conn.stream_mut())).await {
                Err(_) => {
                    if last_server.elapsed() >= self.idle_timeout {
                        self.set_phase(Phase::Closing);
                        return Err(EdgeError::Protocol("replication idle timeout".into()));
                    }
                    continue;
                }
                Ok(msg) => msg?,
            };
            last_server = Instant::now();

            match msg.tag {
                b'd' => match parse_copy_data(msg.payload)? {
                    ReplicationCopyData::KeepAlive {
                        wal_end,
                        reply_requested,
                        ..
                    } => {
                        trace!(%wal_end, reply_requested, "keepalive");
                        if reply_requested {
                            self.send_feedback(true).await?;
                            last_status = Instant::now();
                        }
                    }
                    ReplicationCopyData::XLogData { data, .. } => {
                        let event = pgoutput::decode(data).map_err(|e| {
                            self.set_phase(Phase::Closing);
                            e
                        })?;
                        if let Absorbed::CommitReady(commit_lsn) = self.applier.absorb(event)? {
                            self.set_phase(Phase::Applying);
                            self.apply_with_retry(commit_lsn).await?;
                            self.last_committed = commit_lsn;
                            self.set_phase(Phase::Streaming);
                        }
                    }
                },
                b'E' => {
                    self.set_phase(Phase::Closing);
                    return Err(EdgeError::UpstreamExec(parse_error_response(&msg.payload)));
                }
                // CopyDone / CommandComplete / ReadyForQuery: server ended
                // the copy stream.
                b'c' | b'C' | b'Z' => {
                    info!("server closed the replication stream");
                    self.set_phase(Phase::Closing);
                    return Ok(());
                }
                other => {
                    trace!(tag = %(other as char), "ignoring unexpected message in copy mode");
                }
            }
        }
    }

    /// Apply the pending batch, retrying transient local failures with
    /// exponential backoff before giving up on the stream.
    async fn apply_with_retry(&mut self, commit_lsn: Lsn) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            match self.applier.apply_pending(commit_lsn) {
                Ok(()) => return Ok(()),
                Err(err) if backoff.exhausted() => {
                    error!(%commit_lsn, "apply retries exhausted: {err}");
                    self.set_phase(Phase::Closing);
                    return Err(err);
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(%commit_lsn, ?delay, "local apply failed, retrying: {err}");
                    sleep(delay).await;
                    // A queued DDL may be exactly what the batch is missing.
                    self.drain_ddl();
                }
            }
        }
    }

    /// Apply any client DDL the front end has queued. Failures are logged,
    /// not fatal: on-demand table creation backstops a missed CREATE.
    fn drain_ddl(&mut self) {
        while let Ok(sql) = self.ddl_rx.try_recv() {
            if let Err(err) = self.applier.apply_ddl(&sql) {
                warn!(%sql, "forwarded ddl not applied locally: {err}");
            }
        }
    }

    async fn send_feedback(&mut self, reply_requested: bool) -> Result<()> {
        let payload = encode_standby_status_update(
            self.last_committed,
            pg_epoch_micros(),
            reply_requested,
        );
        write_copy_data(self.conn.stream_mut(), &payload).await
    }

    async fn finish(&mut self) -> Result<()> {
        info!(last_committed = %self.last_committed, "replication loop stopping");
        self.set_phase(Phase::Closing);
        let _ = self.send_feedback(false).await;
        self.conn.close_copy().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pgoutput::{RelationColumn, TupleValue};
    use bytes::Bytes;

    fn text(s: &str) -> TupleValue {
        TupleValue::Text(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn key() -> PositionKey {
        PositionKey {
            source_db: "postgres".into(),
            plugin: "pgoutput".into(),
            publication: "edge_pub".into(),
        }
    }

    fn users_relation() -> RelationDesc {
        RelationDesc {
            oid: 16384,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: b'd',
            columns: vec![
                RelationColumn {
                    key_part: true,
                    name: "id".into(),
                    type_oid: 23,
                    type_modifier: -1,
                },
                RelationColumn {
                    key_part: false,
                    name: "name".into(),
                    type_oid: 25,
                    type_modifier: -1,
                },
            ],
        }
    }

    fn applier() -> Applier {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init_position_table().unwrap();
        let cache = Arc::new(SchemaCache::new());
        Applier::new(store, cache, key())
    }

    #[test]
    fn batch_applies_rows_and_position_atomically() {
        let mut applier = applier();

        assert_eq!(
            applier
                .absorb(ChangeEvent::Begin {
                    final_lsn: Lsn(100),
                    commit_ts: 0,
                    xid: 7,
                })
                .unwrap(),
            Absorbed::Buffered
        );
        applier
            .absorb(ChangeEvent::Relation(users_relation()))
            .unwrap();
        applier
            .absorb(ChangeEvent::Insert {
                rel_oid: 16384,
                new: vec![text("1"), text("a")],
            })
            .unwrap();
        let ready = applier
            .absorb(ChangeEvent::Commit {
                commit_lsn: Lsn(100),
                end_lsn: Lsn(101),
                commit_ts: 0,
            })
            .unwrap();
        assert_eq!(ready, Absorbed::CommitReady(Lsn(100)));

        applier.apply_pending(Lsn(100)).unwrap();
        assert!(!applier.in_tx());

        let rows = applier.store.query("SELECT id, name FROM users").unwrap();
        assert_eq!(rows.rows, vec![vec![Some("1".into()), Some("a".into())]]);
        assert_eq!(applier.store.position(&key()).unwrap(), Some(Lsn(100)));
    }

    #[test]
    fn table_is_created_on_demand_from_relation() {
        let mut applier = applier();
        applier
            .absorb(ChangeEvent::Relation(users_relation()))
            .unwrap();
        applier
            .absorb(ChangeEvent::Insert {
                rel_oid: 16384,
                new: vec![text("1"), text("a")],
            })
            .unwrap();

        let schema = applier.cache.get("users").unwrap();
        assert_eq!(schema.primary_key(), vec!["id"]);
        let catalog = applier.store.catalog().unwrap();
        assert_eq!(catalog[0].0, "users");
    }

    #[test]
    fn row_event_for_unknown_relation_is_a_decode_error() {
        let mut applier = applier();
        let err = applier
            .absorb(ChangeEvent::Insert {
                rel_oid: 999,
                new: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, EdgeError::Decode(_)));
    }

    #[test]
    fn failed_apply_keeps_batch_for_retry() {
        let mut applier = applier();
        applier
            .absorb(ChangeEvent::Relation(users_relation()))
            .unwrap();
        applier
            .absorb(ChangeEvent::Begin {
                final_lsn: Lsn(200),
                commit_ts: 0,
                xid: 8,
            })
            .unwrap();
        applier
            .absorb(ChangeEvent::Insert {
                rel_oid: 16384,
                new: vec![text("1"), text("a")],
            })
            .unwrap();
        // Sabotage: drop the table out from under the batch.
        applier.store.exec("DROP TABLE users").unwrap();

        assert!(applier.apply_pending(Lsn(200)).is_err());
        assert!(applier.in_tx());
        assert!(!applier.pending.is_empty());

        // Recreate and retry the same batch.
        applier
            .store
            .exec("CREATE TABLE users (id int4 PRIMARY KEY, name text)")
            .unwrap();
        applier.apply_pending(Lsn(200)).unwrap();
        assert_eq!(applier.store.position(&key()).unwrap(), Some(Lsn(200)));
    }

    #[test]
    fn ddl_through_the_applier_updates_store_and_cache() {
        let applier = applier();
        applier
            .apply_ddl("CREATE TABLE t (id int PRIMARY KEY, v text)")
            .unwrap();
        assert!(applier.cache.get("t").is_some());

        applier.apply_ddl("ALTER TABLE t ADD COLUMN c int").unwrap();
        let schema = applier.cache.get("t").unwrap();
        assert_eq!(schema.columns.len(), 3);
        assert_eq!(schema.column("c").unwrap().ty, crate::schema::ColType::Int4);

        // The local table really has the column.
        applier
            .store
            .exec("INSERT INTO t (id, v, c) VALUES (1, 'x', 2)")
            .unwrap();

        applier.apply_ddl("DROP TABLE t").unwrap();
        assert!(applier.cache.get("t").is_none());
    }

    #[test]
    fn truncate_lowers_to_delete_for_known_relations() {
        let mut applier = applier();
        applier
            .absorb(ChangeEvent::Relation(users_relation()))
            .unwrap();
        applier
            .absorb(ChangeEvent::Insert {
                rel_oid: 16384,
                new: vec![text("1"), text("a")],
            })
            .unwrap();
        applier
            .absorb(ChangeEvent::Truncate {
                rel_oids: vec![16384, 424242],
                cascade: false,
                restart_identity: false,
            })
            .unwrap();
        applier.apply_pending(Lsn(300)).unwrap();

        let rows = applier.store.query("SELECT count(*) FROM users").unwrap();
        assert_eq!(rows.rows[0][0].as_deref(), Some("0"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        for _ in 0..10 {
            let _ = backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BACKOFF_CAP);
        assert!(backoff.exhausted());
    }
}
