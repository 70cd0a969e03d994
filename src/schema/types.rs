//! Bidirectional type mapping.
//!
//! Each canonical [`ColType`] tag ties together the upstream (PostgreSQL)
//! type names, the local-store declaration name, the catalog OID, and the
//! declared wire size. The OID/size pairs are what clients expect in a
//! RowDescription and must match `pg_type.dat` exactly.

/// Canonical type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Text,
    Bytea,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Jsonb,
}

impl ColType {
    /// The `(oid, size)` pair for a RowDescription field. Variable-length
    /// types report -1.
    pub fn pg_type(self) -> (u32, i16) {
        match self {
            ColType::Bool => (16, 1),
            ColType::Int2 => (21, 2),
            ColType::Int4 => (23, 4),
            ColType::Int8 => (20, 8),
            ColType::Float4 => (700, 4),
            ColType::Float8 => (701, 8),
            ColType::Numeric => (1700, -1),
            ColType::Text => (25, -1),
            ColType::Bytea => (17, -1),
            ColType::Date => (1082, 4),
            ColType::Time => (1083, 8),
            ColType::Timestamp => (1114, 8),
            ColType::TimestampTz => (1184, 8),
            ColType::Uuid => (2950, 16),
            ColType::Json => (114, -1),
            ColType::Jsonb => (3802, -1),
        }
    }

    /// Resolve an upstream (PostgreSQL) type name. Case-insensitive;
    /// multi-word spellings must already be whitespace-normalized to single
    /// spaces.
    pub fn from_upstream_name(name: &str) -> Option<ColType> {
        let lowered = name.to_ascii_lowercase();
        Some(match lowered.as_str() {
            "bool" | "boolean" => ColType::Bool,
            "int2" | "smallint" | "smallserial" => ColType::Int2,
            "int4" | "int" | "integer" | "serial" => ColType::Int4,
            "int8" | "bigint" | "bigserial" => ColType::Int8,
            "float4" | "real" => ColType::Float4,
            "float8" | "double precision" => ColType::Float8,
            "numeric" | "decimal" => ColType::Numeric,
            "text" | "varchar" | "character varying" | "char" | "character" | "bpchar"
            | "name" | "citext" => ColType::Text,
            "bytea" => ColType::Bytea,
            "date" => ColType::Date,
            "time" | "time without time zone" => ColType::Time,
            "timestamp" | "timestamp without time zone" => ColType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ColType::TimestampTz,
            "uuid" => ColType::Uuid,
            "json" => ColType::Json,
            "jsonb" => ColType::Jsonb,
            _ => return None,
        })
    }

    /// Resolve a local-store (SQLite) declaration name. Accepts everything
    /// [`ColType::local_name`] emits plus SQLite's native affinity spellings.
    pub fn from_local_name(name: &str) -> Option<ColType> {
        let lowered = name.to_ascii_lowercase();
        Some(match lowered.as_str() {
            "bool" | "boolean" => ColType::Bool,
            "int2" | "smallint" => ColType::Int2,
            "int4" | "int" => ColType::Int4,
            "int8" | "bigint" | "integer" => ColType::Int8,
            "float4" => ColType::Float4,
            "float8" | "real" | "double" => ColType::Float8,
            "numeric" | "decimal" => ColType::Numeric,
            "text" | "varchar" | "char" | "clob" | "string" => ColType::Text,
            "bytea" | "blob" => ColType::Bytea,
            "date" => ColType::Date,
            "time" => ColType::Time,
            "timestamp" | "datetime" => ColType::Timestamp,
            "timestamptz" => ColType::TimestampTz,
            "uuid" => ColType::Uuid,
            "json" => ColType::Json,
            "jsonb" => ColType::Jsonb,
            _ => return None,
        })
    }

    /// Resolve a pg_type OID, as carried by pgoutput Relation columns.
    pub fn from_oid(oid: u32) -> Option<ColType> {
        Some(match oid {
            16 => ColType::Bool,
            21 => ColType::Int2,
            23 => ColType::Int4,
            20 => ColType::Int8,
            700 => ColType::Float4,
            701 => ColType::Float8,
            1700 => ColType::Numeric,
            25 | 1043 | 1042 | 18 | 19 => ColType::Text,
            17 => ColType::Bytea,
            1082 => ColType::Date,
            1083 => ColType::Time,
            1114 => ColType::Timestamp,
            1184 => ColType::TimestampTz,
            2950 => ColType::Uuid,
            114 => ColType::Json,
            3802 => ColType::Jsonb,
            _ => return None,
        })
    }

    /// Resolve either dialect's spelling; upstream names win on overlap.
    pub fn from_name(name: &str) -> Option<ColType> {
        ColType::from_upstream_name(name).or_else(|| ColType::from_local_name(name))
    }

    /// Declaration token used in local CREATE TABLE text. Must round-trip
    /// through [`ColType::from_local_name`] for catalog bootstrap.
    pub fn local_name(self) -> &'static str {
        match self {
            ColType::Bool => "boolean",
            ColType::Int2 => "int2",
            ColType::Int4 => "int4",
            ColType::Int8 => "int8",
            ColType::Float4 => "float4",
            ColType::Float8 => "float8",
            ColType::Numeric => "numeric",
            ColType::Text => "text",
            ColType::Bytea => "blob",
            ColType::Date => "date",
            ColType::Time => "time",
            ColType::Timestamp => "timestamp",
            ColType::TimestampTz => "timestamptz",
            ColType::Uuid => "uuid",
            ColType::Json => "json",
            ColType::Jsonb => "jsonb",
        }
    }

    /// Canonical upstream spelling, for diagnostics.
    pub fn upstream_name(self) -> &'static str {
        match self {
            ColType::Bool => "bool",
            ColType::Int2 => "int2",
            ColType::Int4 => "int4",
            ColType::Int8 => "int8",
            ColType::Float4 => "float4",
            ColType::Float8 => "float8",
            ColType::Numeric => "numeric",
            ColType::Text => "text",
            ColType::Bytea => "bytea",
            ColType::Date => "date",
            ColType::Time => "time",
            ColType::Timestamp => "timestamp",
            ColType::TimestampTz => "timestamptz",
            ColType::Uuid => "uuid",
            ColType::Json => "json",
            ColType::Jsonb => "jsonb",
        }
    }
}
