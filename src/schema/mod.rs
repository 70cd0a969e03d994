//! Table schema model: type mapping, DDL parsing, and the shared snapshot.
//!
//! The replica's picture of each table comes from re-parsing the local
//! store's own `CREATE TABLE` text at startup ([`ddl`]) and from DDL applied
//! in replication order afterwards ([`cache`]). Row-event translation and
//! RowDescription encoding both key off this model.

pub mod cache;
pub mod ddl;
pub mod types;

pub use cache::{AlterOp, SchemaCache, SchemaSnapshot};
pub use ddl::{DdlParseError, parse_create_table};
pub use types::ColType;

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColType,
    /// Length/precision suffix, verbatim without parentheses (`"255"`,
    /// `"10,2"`). Carried through for fidelity; the local store ignores it.
    pub modifier: Option<String>,
    pub not_null: bool,
    /// Default expression, verbatim.
    pub default: Option<String>,
    pub primary_key: bool,
    pub unique: bool,
}

impl ColumnDef {
    /// A plain nullable column with no constraints.
    pub fn plain(name: impl Into<String>, ty: ColType) -> Self {
        Self {
            name: name.into(),
            ty,
            modifier: None,
            not_null: false,
            default: None,
            primary_key: false,
            unique: false,
        }
    }
}

/// A table layout: ordered columns plus the primary-key subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Primary-key column names, in declaration order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }
}
