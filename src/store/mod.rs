//! Embedded SQLite store.
//!
//! One connection shared by the replication apply loop (writer) and the
//! front-end sessions (readers), behind a mutex; SQLite calls are short and
//! local, so contention stays negligible at edge scale. The replay position
//! lives in `postgres_pos` and is only ever written inside the same
//! transaction as the batch it belongs to, which is what makes replay after
//! a crash produce no duplicate effects.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::{EdgeError, Result};
use crate::lsn::Lsn;
use crate::sqlgen::LocalStatement;

/// Key under which a replay position is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionKey {
    pub source_db: String,
    pub plugin: String,
    pub publication: String,
}

/// One result column: name plus declared type, when the statement yields one.
/// Expression columns have no declared type.
#[derive(Debug, Clone)]
pub struct QueryColumn {
    pub name: String,
    pub decl_type: Option<String>,
}

/// The storage class observed in a result column, used as a type fallback
/// for expression columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Real,
    Text,
    Blob,
}

/// A fully materialized read result, values already rendered as text.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<QueryColumn>,
    /// Kind of the first non-null value seen per column.
    pub observed: Vec<Option<ValueKind>>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// Handle to the embedded store. Cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// Execute one statement; returns affected rows.
    pub fn exec(&self, sql: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(sql, [])?)
    }

    /// Run a read and materialize the full result.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| EdgeError::LocalQuery(e.to_string()))?;

        let columns: Vec<QueryColumn> = stmt
            .columns()
            .iter()
            .map(|c| QueryColumn {
                name: c.name().to_string(),
                decl_type: c.decl_type().map(|t| t.to_string()),
            })
            .collect();

        let ncols = columns.len();
        let mut observed: Vec<Option<ValueKind>> = vec![None; ncols];
        let mut out_rows = Vec::new();

        let mut rows = stmt
            .query([])
            .map_err(|e| EdgeError::LocalQuery(e.to_string()))?;
        while let Some(row) = rows.next().map_err(|e| EdgeError::LocalQuery(e.to_string()))? {
            let mut out = Vec::with_capacity(ncols);
            for i in 0..ncols {
                let value = row
                    .get_ref(i)
                    .map_err(|e| EdgeError::LocalQuery(e.to_string()))?;
                if observed[i].is_none() {
                    observed[i] = kind_of(value);
                }
                out.push(render_value(value));
            }
            out_rows.push(out);
        }

        Ok(QueryResult {
            columns,
            observed,
            rows: out_rows,
        })
    }

    /// Create the replay-position table if missing.
    pub fn init_position_table(&self) -> Result<()> {
        self.exec(
            "CREATE TABLE IF NOT EXISTS postgres_pos (\
             source_db text, \
             plugin text, \
             publication text, \
             pos text, \
             PRIMARY KEY (source_db, plugin, publication))",
        )?;
        Ok(())
    }

    /// Last persisted replay position for the key, if any.
    pub fn position(&self, key: &PositionKey) -> Result<Option<Lsn>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT pos FROM postgres_pos \
             WHERE source_db = ?1 AND plugin = ?2 AND publication = ?3",
        )?;
        let mut rows = stmt.query((&key.source_db, &key.plugin, &key.publication))?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let text: String = row.get(0)?;
        let lsn = text
            .parse::<Lsn>()
            .map_err(|e| EdgeError::LocalQuery(format!("stored position corrupt: {e}")))?;
        Ok(Some(lsn))
    }

    /// Apply a replication batch and advance the persisted position in one
    /// transaction. On any failure the whole batch rolls back, position
    /// included.
    pub fn apply_batch(
        &self,
        statements: &[LocalStatement],
        key: &PositionKey,
        commit_lsn: Lsn,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| EdgeError::LocalApply(e.to_string()))?;

        for stmt in statements {
            tx.execute(&stmt.sql, rusqlite::params_from_iter(stmt.args.iter()))
                .map_err(|e| EdgeError::LocalApply(format!("{}: {e}", stmt.sql)))?;
        }

        tx.execute(
            "INSERT INTO postgres_pos (source_db, plugin, publication, pos) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (source_db, plugin, publication) DO UPDATE SET pos = excluded.pos",
            (
                &key.source_db,
                &key.plugin,
                &key.publication,
                commit_lsn.to_string(),
            ),
        )
        .map_err(|e| EdgeError::LocalApply(e.to_string()))?;

        tx.commit().map_err(|e| EdgeError::LocalApply(e.to_string()))
    }

    /// `(table, create_sql)` for every user table, for schema-cache
    /// bootstrap. The position table and SQLite internals are not user
    /// tables.
    pub fn catalog(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, sql FROM sqlite_schema \
             WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' \
             AND name <> 'postgres_pos' \
             ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn kind_of(value: ValueRef<'_>) -> Option<ValueKind> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some(ValueKind::Integer),
        ValueRef::Real(_) => Some(ValueKind::Real),
        ValueRef::Text(_) => Some(ValueKind::Text),
        ValueRef::Blob(_) => Some(ValueKind::Blob),
    }
}

/// Render a stored value in PostgreSQL text format.
fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            let mut out = String::with_capacity(2 + b.len() * 2);
            out.push_str("\\x");
            for byte in b {
                out.push_str(&format!("{byte:02x}"));
            }
            Some(out)
        }
    }
}
