//! Row-event translation: decoded change events to local statements.
//!
//! Each generator takes the event's relation descriptor plus the table's
//! schema from the current snapshot and emits one parameterized statement.
//! Text-format values are cast per the column's declared type before
//! binding; binary-format values pass through as blobs.

use bytes::Bytes;
use rusqlite::types::Value;

use crate::error::{EdgeError, Result};
use crate::protocol::pgoutput::{RelationDesc, TupleData, TupleValue};
use crate::schema::{ColType, ColumnDef, TableSchema};

use super::quote_ident;

/// A parameterized local statement with its argument vector.
#[derive(Debug, Clone)]
pub struct LocalStatement {
    pub sql: String,
    pub args: Vec<Value>,
}

/// Build a [`TableSchema`] from a relation descriptor, for tables that exist
/// upstream but not yet locally. Column types come from the descriptor's
/// type OIDs; key columns become the primary key.
pub fn table_from_relation(rel: &RelationDesc) -> Result<TableSchema> {
    let mut columns = Vec::with_capacity(rel.columns.len());
    for rc in &rel.columns {
        let ty = ColType::from_oid(rc.type_oid).ok_or_else(|| {
            EdgeError::UnsupportedType(format!(
                "oid {} on {}.{}",
                rc.type_oid, rel.name, rc.name
            ))
        })?;
        let mut col = ColumnDef::plain(rc.name.clone(), ty);
        col.primary_key = rc.key_part;
        col.not_null = rc.key_part;
        columns.push(col);
    }
    Ok(TableSchema::new(rel.name.clone(), columns))
}

/// `Insert` -> `INSERT INTO t (c1, ...) VALUES (?, ...)`.
pub fn insert(rel: &RelationDesc, schema: &TableSchema, new: &TupleData) -> Result<LocalStatement> {
    check_arity(rel, new)?;

    let mut cols = String::new();
    let mut placeholders = String::new();
    let mut args = Vec::with_capacity(new.len());
    for (rc, value) in rel.columns.iter().zip(new) {
        if !cols.is_empty() {
            cols.push_str(", ");
            placeholders.push_str(", ");
        }
        cols.push_str(&quote_ident(&rc.name));
        placeholders.push('?');
        args.push(bind_value(column_type(schema, rel, &rc.name)?, value, rel)?);
    }

    Ok(LocalStatement {
        sql: format!(
            "INSERT INTO {} ({cols}) VALUES ({placeholders})",
            quote_ident(&rel.name)
        ),
        args,
    })
}

/// `Update` -> `UPDATE t SET c1 = ?, ... WHERE pk1 = ? AND ...`.
///
/// The WHERE values come from the old row image when the table publishes
/// one (REPLICA IDENTITY FULL), else from the key image, else from the new
/// tuple. Columns with unchanged-TOAST markers are left out of the SET list
/// so the stored value survives.
pub fn update(
    rel: &RelationDesc,
    schema: &TableSchema,
    old: Option<&TupleData>,
    key: Option<&TupleData>,
    new: &TupleData,
) -> Result<LocalStatement> {
    check_arity(rel, new)?;

    let pk = schema.primary_key();
    if pk.is_empty() {
        return Err(EdgeError::UpdateWithoutKey(rel.name.clone()));
    }

    let mut sets = String::new();
    let mut args = Vec::new();
    for (rc, value) in rel.columns.iter().zip(new) {
        if matches!(value, TupleValue::Toast) {
            continue;
        }
        if !sets.is_empty() {
            sets.push_str(", ");
        }
        sets.push_str(&quote_ident(&rc.name));
        sets.push_str(" = ?");
        args.push(bind_value(column_type(schema, rel, &rc.name)?, value, rel)?);
    }
    if sets.is_empty() {
        return Err(EdgeError::Decode(format!(
            "update on {} carries no assignable columns",
            rel.name
        )));
    }

    let where_tuple = old.or(key).unwrap_or(new);
    check_arity(rel, where_tuple)?;
    let (clause, mut where_args) = key_clause(rel, schema, &pk, where_tuple)?;
    args.append(&mut where_args);

    Ok(LocalStatement {
        sql: format!(
            "UPDATE {} SET {sets} WHERE {clause}",
            quote_ident(&rel.name)
        ),
        args,
    })
}

/// `Delete` -> `DELETE FROM t WHERE pk1 = ? AND ...`.
pub fn delete(rel: &RelationDesc, schema: &TableSchema, old: &TupleData) -> Result<LocalStatement> {
    check_arity(rel, old)?;

    let pk = schema.primary_key();
    if pk.is_empty() {
        return Err(EdgeError::DeleteWithoutKey(rel.name.clone()));
    }

    let (clause, args) = key_clause(rel, schema, &pk, old)?;
    Ok(LocalStatement {
        sql: format!("DELETE FROM {} WHERE {clause}", quote_ident(&rel.name)),
        args,
    })
}

/// `Truncate` -> `DELETE FROM t`; the local store has no TRUNCATE.
pub fn truncate(table: &str) -> LocalStatement {
    LocalStatement {
        sql: format!("DELETE FROM {}", quote_ident(table)),
        args: Vec::new(),
    }
}

fn check_arity(rel: &RelationDesc, tuple: &TupleData) -> Result<()> {
    if tuple.len() != rel.columns.len() {
        return Err(EdgeError::Decode(format!(
            "tuple for {} has {} columns, relation has {}",
            rel.name,
            tuple.len(),
            rel.columns.len()
        )));
    }
    Ok(())
}

fn column_type(schema: &TableSchema, rel: &RelationDesc, column: &str) -> Result<ColType> {
    if let Some(col) = schema.column(column) {
        return Ok(col.ty);
    }
    // Column not in the snapshot yet; fall back to the descriptor's OID.
    rel.columns
        .iter()
        .find(|rc| rc.name == column)
        .and_then(|rc| ColType::from_oid(rc.type_oid))
        .ok_or_else(|| {
            EdgeError::UnsupportedType(format!("column {column} of {}", rel.name))
        })
}

fn key_clause(
    rel: &RelationDesc,
    schema: &TableSchema,
    pk: &[&str],
    tuple: &TupleData,
) -> Result<(String, Vec<Value>)> {
    let mut clause = String::new();
    let mut args = Vec::with_capacity(pk.len());
    for key in pk {
        let idx = rel
            .columns
            .iter()
            .position(|rc| &rc.name == key)
            .ok_or_else(|| {
                EdgeError::Decode(format!(
                    "key column {key} missing from relation {}",
                    rel.name
                ))
            })?;
        if !clause.is_empty() {
            clause.push_str(" AND ");
        }
        clause.push_str(&quote_ident(key));
        clause.push_str(" = ?");
        args.push(bind_value(
            column_type(schema, rel, key)?,
            &tuple[idx],
            rel,
        )?);
    }
    Ok((clause, args))
}

/// Cast a tuple value to a local binding per the column's declared type.
fn bind_value(ty: ColType, value: &TupleValue, rel: &RelationDesc) -> Result<Value> {
    match value {
        TupleValue::Null => Ok(Value::Null),
        TupleValue::Binary(data) => Ok(Value::Blob(data.to_vec())),
        TupleValue::Toast => Err(EdgeError::Decode(format!(
            "unchanged-toast value reached binding on {}",
            rel.name
        ))),
        TupleValue::Text(data) => cast_text(ty, data),
    }
}

fn cast_text(ty: ColType, data: &Bytes) -> Result<Value> {
    let text = std::str::from_utf8(data)
        .map_err(|_| EdgeError::Decode("non-utf8 text value".into()))?;
    match ty {
        ColType::Bool => match text {
            "t" | "true" | "1" => Ok(Value::Integer(1)),
            "f" | "false" | "0" => Ok(Value::Integer(0)),
            other => Err(EdgeError::Decode(format!("invalid bool literal: {other}"))),
        },
        ColType::Int2 | ColType::Int4 | ColType::Int8 => text
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| EdgeError::Decode(format!("invalid integer literal: {text}"))),
        ColType::Float4 | ColType::Float8 => text
            .parse::<f64>()
            .map(Value::Real)
            .map_err(|_| EdgeError::Decode(format!("invalid float literal: {text}"))),
        ColType::Bytea => decode_bytea(text),
        // Numeric keeps its exact decimal text; temporal, uuid, and json
        // values stay in their ISO/text representations.
        _ => Ok(Value::Text(text.to_string())),
    }
}

/// PostgreSQL text-format bytea is `\x` followed by hex.
fn decode_bytea(text: &str) -> Result<Value> {
    let Some(hex) = text.strip_prefix("\\x") else {
        // Legacy escape format; store the raw bytes as-is.
        return Ok(Value::Blob(text.as_bytes().to_vec()));
    };
    if hex.len() % 2 != 0 {
        return Err(EdgeError::Decode("odd-length bytea hex".into()));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    let bytes = hex.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char)
            .to_digit(16)
            .ok_or_else(|| EdgeError::Decode("invalid bytea hex".into()))?;
        let lo = (pair[1] as char)
            .to_digit(16)
            .ok_or_else(|| EdgeError::Decode("invalid bytea hex".into()))?;
        out.push((hi * 16 + lo) as u8);
    }
    Ok(Value::Blob(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pgoutput::RelationColumn;
    use crate::schema::parse_create_table;

    fn users_rel() -> RelationDesc {
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
                RelationColumn {
                    key_part: false,
                    name: "active".into(),
                    type_oid: 16,
                    type_modifier: -1,
                },
            ],
        }
    }

    fn users_schema() -> TableSchema {
        parse_create_table("create table users (id int4 primary key, name text, active boolean)")
            .unwrap()
    }

    fn text(s: &str) -> TupleValue {
        TupleValue::Text(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn insert_binds_in_column_order() {
        let stmt = insert(
            &users_rel(),
            &users_schema(),
            &vec![text("1"), text("ada"), text("t")],
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"id\", \"name\", \"active\") VALUES (?, ?, ?)"
        );
        assert_eq!(
            stmt.args,
            vec![
                Value::Integer(1),
                Value::Text("ada".into()),
                Value::Integer(1)
            ]
        );
    }

    #[test]
    fn insert_null_marker_binds_null() {
        let stmt = insert(
            &users_rel(),
            &users_schema(),
            &vec![text("2"), TupleValue::Null, text("f")],
        )
        .unwrap();
        assert_eq!(stmt.args[1], Value::Null);
        assert_eq!(stmt.args[2], Value::Integer(0));
    }

    #[test]
    fn update_uses_primary_key_from_new_tuple() {
        let stmt = update(
            &users_rel(),
            &users_schema(),
            None,
            None,
            &vec![text("7"), text("bob"), text("t")],
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"users\" SET \"id\" = ?, \"name\" = ?, \"active\" = ? WHERE \"id\" = ?"
        );
        assert_eq!(stmt.args.last(), Some(&Value::Integer(7)));
    }

    #[test]
    fn update_prefers_old_image_for_where() {
        let old = vec![text("7"), text("old"), text("t")];
        let stmt = update(
            &users_rel(),
            &users_schema(),
            Some(&old),
            None,
            &vec![text("8"), text("new"), text("t")],
        )
        .unwrap();
        // pk value comes from the old image, so the row keyed 7 moves to 8
        assert_eq!(stmt.args.last(), Some(&Value::Integer(7)));
    }

    #[test]
    fn update_without_key_fails() {
        let schema =
            parse_create_table("create table users (id int4, name text, active boolean)").unwrap();
        let err = update(
            &users_rel(),
            &schema,
            None,
            None,
            &vec![text("1"), text("x"), text("t")],
        )
        .unwrap_err();
        assert!(matches!(err, EdgeError::UpdateWithoutKey(t) if t == "users"));
    }

    #[test]
    fn update_skips_toast_columns() {
        let stmt = update(
            &users_rel(),
            &users_schema(),
            None,
            None,
            &vec![text("7"), TupleValue::Toast, text("f")],
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"users\" SET \"id\" = ?, \"active\" = ? WHERE \"id\" = ?"
        );
    }

    #[test]
    fn delete_uses_old_image_key() {
        let stmt = delete(
            &users_rel(),
            &users_schema(),
            &vec![text("3"), TupleValue::Null, TupleValue::Null],
        )
        .unwrap();
        assert_eq!(stmt.sql, "DELETE FROM \"users\" WHERE \"id\" = ?");
        assert_eq!(stmt.args, vec![Value::Integer(3)]);
    }

    #[test]
    fn delete_without_key_fails() {
        let schema =
            parse_create_table("create table users (id int4, name text, active boolean)").unwrap();
        let err = delete(&users_rel(), &schema, &vec![text("3"), TupleValue::Null, TupleValue::Null])
            .unwrap_err();
        assert!(matches!(err, EdgeError::DeleteWithoutKey(_)));
    }

    #[test]
    fn truncate_lowers_to_delete() {
        let stmt = truncate("users");
        assert_eq!(stmt.sql, "DELETE FROM \"users\"");
        assert!(stmt.args.is_empty());
    }

    #[test]
    fn arity_mismatch_is_a_decode_error() {
        let err = insert(&users_rel(), &users_schema(), &vec![text("1")]).unwrap_err();
        assert!(matches!(err, EdgeError::Decode(_)));
    }

    #[test]
    fn bytea_hex_decodes_to_blob() {
        assert_eq!(
            cast_text(ColType::Bytea, &Bytes::from_static(b"\\x00ff10")).unwrap(),
            Value::Blob(vec![0x00, 0xff, 0x10])
        );
        assert!(cast_text(ColType::Bytea, &Bytes::from_static(b"\\xf")).is_err());
    }

    #[test]
    fn numeric_and_timestamp_stay_textual() {
        assert_eq!(
            cast_text(ColType::Numeric, &Bytes::from_static(b"12.3400")).unwrap(),
            Value::Text("12.3400".into())
        );
        assert_eq!(
            cast_text(ColType::Timestamp, &Bytes::from_static(b"2024-01-01 00:00:00")).unwrap(),
            Value::Text("2024-01-01 00:00:00".into())
        );
    }

    #[test]
    fn table_from_relation_maps_oids_and_keys() {
        let schema = table_from_relation(&users_rel()).unwrap();
        assert_eq!(schema.primary_key(), vec!["id"]);
        assert_eq!(schema.columns[2].ty, ColType::Bool);

        let mut rel = users_rel();
        rel.columns[0].type_oid = 600; // point: unmapped
        assert!(matches!(
            table_from_relation(&rel).unwrap_err(),
            EdgeError::UnsupportedType(_)
        ));
    }
}
