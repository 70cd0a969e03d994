//! Shared table-schema snapshot.
//!
//! One writer (the replication apply loop) mutates the cache; front-end
//! sessions only read it. Mutations are copy-on-write: the map and the
//! touched `TableSchema` are cloned, then a fresh `Arc` is swapped in, so a
//! reader holding a snapshot sees a consistent schema for the duration of
//! its operation and the read path never blocks on the writer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{EdgeError, Result};

use super::types::ColType;
use super::{ColumnDef, TableSchema, ddl};

/// An immutable point-in-time view: table name -> schema.
pub type SchemaSnapshot = Arc<HashMap<String, Arc<TableSchema>>>;

/// Column-level schema change.
#[derive(Debug, Clone)]
pub enum AlterOp {
    AddColumn(ColumnDef),
    DropColumn(String),
    RenameColumn { from: String, to: String },
    ChangeType {
        column: String,
        ty: ColType,
        modifier: Option<String>,
    },
}

/// The process-wide schema cache.
#[derive(Debug, Default)]
pub struct SchemaCache {
    inner: RwLock<SchemaSnapshot>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache by re-parsing `(table, create_sql)` catalog rows, as
    /// returned by the local store at startup.
    pub fn bootstrap<'a>(
        catalog: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        for (name, sql) in catalog {
            let schema = ddl::parse_create_table(sql).map_err(|e| {
                EdgeError::LocalQuery(format!("catalog entry for {name} unparseable: {e}"))
            })?;
            map.insert(schema.name.clone(), Arc::new(schema));
        }
        Ok(Self {
            inner: RwLock::new(Arc::new(map)),
        })
    }

    /// Cheap reference to the current snapshot.
    pub fn snapshot(&self) -> SchemaSnapshot {
        self.inner.read().clone()
    }

    pub fn get(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.inner.read().get(table).cloned()
    }

    pub fn table_count(&self) -> usize {
        self.inner.read().len()
    }

    pub fn apply_create(&self, schema: TableSchema) {
        let mut guard = self.inner.write();
        let mut map = (**guard).clone();
        map.insert(schema.name.clone(), Arc::new(schema));
        *guard = Arc::new(map);
    }

    pub fn apply_drop(&self, table: &str) {
        let mut guard = self.inner.write();
        let mut map = (**guard).clone();
        map.remove(table);
        *guard = Arc::new(map);
    }

    pub fn apply_alter(&self, table: &str, op: AlterOp) -> Result<()> {
        let mut guard = self.inner.write();
        let mut map = (**guard).clone();
        let schema = map.get(table).ok_or_else(|| {
            EdgeError::LocalApply(format!("alter on unknown table {table}"))
        })?;
        let mut schema = (**schema).clone();

        match op {
            AlterOp::AddColumn(col) => {
                if schema.column(&col.name).is_some() {
                    return Err(EdgeError::LocalApply(format!(
                        "column {} already exists on {table}",
                        col.name
                    )));
                }
                schema.columns.push(col);
            }
            AlterOp::DropColumn(name) => {
                let before = schema.columns.len();
                schema.columns.retain(|c| c.name != name);
                if schema.columns.len() == before {
                    return Err(EdgeError::LocalApply(format!(
                        "drop of unknown column {name} on {table}"
                    )));
                }
            }
            AlterOp::RenameColumn { from, to } => {
                let col = schema
                    .columns
                    .iter_mut()
                    .find(|c| c.name == from)
                    .ok_or_else(|| {
                        EdgeError::LocalApply(format!(
                            "rename of unknown column {from} on {table}"
                        ))
                    })?;
                col.name = to;
            }
            AlterOp::ChangeType {
                column,
                ty,
                modifier,
            } => {
                let col = schema
                    .columns
                    .iter_mut()
                    .find(|c| c.name == column)
                    .ok_or_else(|| {
                        EdgeError::LocalApply(format!(
                            "type change of unknown column {column} on {table}"
                        ))
                    })?;
                col.ty = ty;
                col.modifier = modifier;
            }
        }

        map.insert(table.to_string(), Arc::new(schema));
        *guard = Arc::new(map);
        Ok(())
    }
}
