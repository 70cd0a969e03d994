//! Change-translation layer.
//!
//! Converts decoded replication events ([`change`]) and upstream DDL text
//! ([`rewrite`]) into statements for the embedded store, keyed by the tracked
//! schema snapshot.

pub mod change;
pub mod rewrite;

pub use change::{LocalStatement, delete, insert, table_from_relation, truncate, update};
pub use rewrite::{LocalDdl, rewrite_ddl};

use crate::schema::TableSchema;

/// Quote an identifier for the local store, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a [`TableSchema`] as local `CREATE TABLE` text. The output must
/// re-parse through [`crate::schema::parse_create_table`], since it becomes
/// the catalog entry the next bootstrap reads back.
pub fn render_create_table(schema: &TableSchema) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (", quote_ident(&schema.name));
    for (i, col) in schema.columns.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&quote_ident(&col.name));
        sql.push(' ');
        sql.push_str(col.ty.local_name());
        if let Some(modifier) = &col.modifier {
            sql.push('(');
            sql.push_str(modifier);
            sql.push(')');
        }
        if col.not_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &col.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        if col.unique {
            sql.push_str(" UNIQUE");
        }
    }
    let pk = schema.primary_key();
    if !pk.is_empty() {
        sql.push_str(", PRIMARY KEY (");
        for (i, key) in pk.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&quote_ident(key));
        }
        sql.push(')');
    }
    sql.push(')');
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColType, ColumnDef, parse_create_table};

    #[test]
    fn rendered_create_table_round_trips_through_parser() {
        let mut id = ColumnDef::plain("id", ColType::Int4);
        id.primary_key = true;
        id.not_null = true;
        let mut name = ColumnDef::plain("name", ColType::Text);
        name.default = Some("'anon'".into());
        let schema = TableSchema::new("users", vec![id, name]);

        let sql = render_create_table(&schema);
        let reparsed = parse_create_table(&sql).unwrap();
        assert_eq!(reparsed.name, "users");
        assert_eq!(reparsed.primary_key(), vec!["id"]);
        assert_eq!(reparsed.columns[1].default.as_deref(), Some("'anon'"));
    }

    #[test]
    fn quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
