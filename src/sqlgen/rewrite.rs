//! Bounded lexical DDL rewrite.
//!
//! Translates the upstream dialect's `CREATE/ALTER/DROP TABLE` into local
//! statements plus the matching schema-cache mutation, without a full AST:
//! type tokens are substituted through the mapper, storage clauses
//! (`TABLESPACE`, `WITH (...)`, trailing options) are stripped, and schema
//! qualifications collapse to the bare table name. Anything outside the
//! subset fails with `UnsupportedDdl`.

use crate::error::{EdgeError, Result};
use crate::schema::ddl::{self, Lexer, Tok};
use crate::schema::{ColType, ColumnDef, TableSchema};

use super::{quote_ident, render_create_table};

/// A translated DDL statement: the local SQL to execute (if any) plus what
/// the schema cache must learn.
#[derive(Debug, Clone)]
pub enum LocalDdl {
    CreateTable {
        schema: TableSchema,
        sql: String,
    },
    DropTable {
        table: String,
        sql: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
        sql: String,
    },
    DropColumn {
        table: String,
        column: String,
        sql: String,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
        sql: String,
    },
    /// Cache-only: the local store is dynamically typed, so no statement is
    /// executed.
    ChangeColumnType {
        table: String,
        column: String,
        ty: ColType,
        modifier: Option<String>,
    },
}

/// Rewrite one upstream DDL statement for the local store.
pub fn rewrite_ddl(sql: &str) -> Result<LocalDdl> {
    let mut lex = Lexer::new(sql);
    let head = lex.peek()?;
    match head {
        Some(Tok::Word(w)) if w == "create" => rewrite_create(sql, &mut lex),
        Some(Tok::Word(w)) if w == "drop" => rewrite_drop(&mut lex),
        Some(Tok::Word(w)) if w == "alter" => rewrite_alter(&mut lex),
        _ => Err(EdgeError::UnsupportedDdl(format!(
            "unrecognized statement: {}",
            sql.trim()
        ))),
    }
}

fn rewrite_create(sql: &str, lex: &mut Lexer<'_>) -> Result<LocalDdl> {
    lex.expect_word("create")?;
    // Persistence modifiers don't exist locally.
    while matches!(lex.peek()?,
        Some(Tok::Word(w)) if matches!(w.as_str(), "unlogged" | "temporary" | "temp"))
    {
        lex.next()?;
    }
    lex.expect_word("table")?;
    if matches!(lex.peek()?, Some(Tok::Word(w)) if w == "if") {
        lex.expect_word("if")?;
        lex.expect_word("not")?;
        lex.expect_word("exists")?;
    }
    let table = lex.identifier()?;

    // Reparse just "create table <name> ( ... )": everything after the
    // balanced column list (WITH (...), TABLESPACE ...) is stripped.
    let (open, close) = column_list_span(sql, lex.offset())?;
    let sanitized = format!("create table {} {}", quote_ident(&table), &sql[open..=close]);
    let schema = ddl::parse_create_table(&sanitized)?;

    let local_sql = render_create_table(&schema);
    Ok(LocalDdl::CreateTable {
        schema,
        sql: local_sql,
    })
}

/// Find the balanced `( ... )` span starting at or after `from`, honoring
/// quoted identifiers and literals.
fn column_list_span(sql: &str, from: usize) -> Result<(usize, usize)> {
    let b = sql.as_bytes();
    let mut i = from;
    let mut open = None;
    let mut depth = 0usize;
    while i < b.len() {
        match b[i] {
            q @ (b'"' | b'\'') => {
                i += 1;
                while i < b.len() && b[i] != q {
                    i += 1;
                }
            }
            b'(' => {
                if open.is_none() {
                    open = Some(i);
                }
                depth += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(open) = open {
                        return Ok((open, i));
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(EdgeError::UnsupportedDdl(
        "create table without a column list".into(),
    ))
}

fn rewrite_drop(lex: &mut Lexer<'_>) -> Result<LocalDdl> {
    lex.expect_word("drop")?;
    lex.expect_word("table")?;
    if matches!(lex.peek()?, Some(Tok::Word(w)) if w == "if") {
        lex.expect_word("if")?;
        lex.expect_word("exists")?;
    }
    let table = lex.identifier()?;
    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&table));
    Ok(LocalDdl::DropTable { table, sql })
}

fn rewrite_alter(lex: &mut Lexer<'_>) -> Result<LocalDdl> {
    lex.expect_word("alter")?;
    lex.expect_word("table")?;
    if matches!(lex.peek()?, Some(Tok::Word(w)) if w == "only") {
        lex.next()?;
    }
    let table = lex.identifier()?;

    let verb = match lex.next()? {
        Some(Tok::Word(w)) => w,
        other => {
            return Err(EdgeError::UnsupportedDdl(format!(
                "alter table {table}: expected action, found {other:?}"
            )));
        }
    };

    match verb.as_str() {
        "add" => {
            skip_word(lex, "column")?;
            let column = ddl::parse_column(lex, &[])?;
            let mut sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(&table),
                quote_ident(&column.name),
                column.ty.local_name()
            );
            if let Some(modifier) = &column.modifier {
                sql.push('(');
                sql.push_str(modifier);
                sql.push(')');
            }
            if column.not_null {
                sql.push_str(" NOT NULL");
            }
            if let Some(default) = &column.default {
                sql.push_str(" DEFAULT ");
                sql.push_str(default);
            }
            Ok(LocalDdl::AddColumn { table, column, sql })
        }
        "drop" => {
            skip_word(lex, "column")?;
            if matches!(lex.peek()?, Some(Tok::Word(w)) if w == "if") {
                lex.expect_word("if")?;
                lex.expect_word("exists")?;
            }
            let column = lex.identifier()?;
            let sql = format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(&table),
                quote_ident(&column)
            );
            Ok(LocalDdl::DropColumn { table, column, sql })
        }
        "rename" => {
            match lex.peek()? {
                Some(Tok::Word(w)) if w == "to" => {
                    return Err(EdgeError::UnsupportedDdl(format!(
                        "rename of table {table} is not supported"
                    )));
                }
                _ => {}
            }
            skip_word(lex, "column")?;
            let from = lex.identifier()?;
            lex.expect_word("to")?;
            let to = lex.identifier()?;
            let sql = format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(&table),
                quote_ident(&from),
                quote_ident(&to)
            );
            Ok(LocalDdl::RenameColumn {
                table,
                from,
                to,
                sql,
            })
        }
        "alter" => {
            skip_word(lex, "column")?;
            let column = lex.identifier()?;
            // "SET DATA TYPE t" or "TYPE t"
            if matches!(lex.peek()?, Some(Tok::Word(w)) if w == "set") {
                lex.expect_word("set")?;
                lex.expect_word("data")?;
            }
            lex.expect_word("type")?;
            let (ty, modifier) = ddl::parse_type(lex)?;
            Ok(LocalDdl::ChangeColumnType {
                table,
                column,
                ty,
                modifier,
            })
        }
        other => Err(EdgeError::UnsupportedDdl(format!(
            "alter table {table} {other} ... is not supported"
        ))),
    }
}

fn skip_word(lex: &mut Lexer<'_>, word: &str) -> Result<()> {
    if matches!(lex.peek()?, Some(Tok::Word(w)) if w == word) {
        lex.next()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_substitutes_types_and_strips_storage() {
        let ddl = rewrite_ddl(
            "CREATE TABLE public.users (id serial PRIMARY KEY, name character varying(40)) \
             WITH (fillfactor = 70) TABLESPACE fast",
        )
        .unwrap();
        match ddl {
            LocalDdl::CreateTable { schema, sql } => {
                assert_eq!(schema.name, "users");
                assert_eq!(schema.columns[0].ty, ColType::Int4);
                assert_eq!(schema.columns[1].ty, ColType::Text);
                assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"users\""));
                assert!(sql.contains("\"name\" text(40)"));
                assert!(!sql.to_lowercase().contains("tablespace"));
                assert!(!sql.to_lowercase().contains("fillfactor"));
            }
            other => panic!("expected CreateTable, got {other:?}"),
        }
    }

    #[test]
    fn drop_table_becomes_if_exists() {
        match rewrite_ddl("drop table if exists public.users cascade").unwrap() {
            LocalDdl::DropTable { table, sql } => {
                assert_eq!(table, "users");
                assert_eq!(sql, "DROP TABLE IF EXISTS \"users\"");
            }
            other => panic!("expected DropTable, got {other:?}"),
        }
    }

    #[test]
    fn alter_add_column_translates_type() {
        match rewrite_ddl("ALTER TABLE t ADD COLUMN c int").unwrap() {
            LocalDdl::AddColumn { table, column, sql } => {
                assert_eq!(table, "t");
                assert_eq!(column.name, "c");
                assert_eq!(column.ty, ColType::Int4);
                assert_eq!(sql, "ALTER TABLE \"t\" ADD COLUMN \"c\" int4");
            }
            other => panic!("expected AddColumn, got {other:?}"),
        }
    }

    #[test]
    fn alter_add_column_keeps_not_null_default() {
        match rewrite_ddl("alter table t add column n bigint not null default 0").unwrap() {
            LocalDdl::AddColumn { column, sql, .. } => {
                assert!(column.not_null);
                assert_eq!(column.default.as_deref(), Some("0"));
                assert_eq!(
                    sql,
                    "ALTER TABLE \"t\" ADD COLUMN \"n\" int8 NOT NULL DEFAULT 0"
                );
            }
            other => panic!("expected AddColumn, got {other:?}"),
        }
    }

    #[test]
    fn alter_drop_and_rename_column() {
        match rewrite_ddl("alter table t drop column if exists c").unwrap() {
            LocalDdl::DropColumn { column, sql, .. } => {
                assert_eq!(column, "c");
                assert_eq!(sql, "ALTER TABLE \"t\" DROP COLUMN \"c\"");
            }
            other => panic!("expected DropColumn, got {other:?}"),
        }

        match rewrite_ddl("alter table t rename column a to b").unwrap() {
            LocalDdl::RenameColumn { from, to, sql, .. } => {
                assert_eq!((from.as_str(), to.as_str()), ("a", "b"));
                assert_eq!(sql, "ALTER TABLE \"t\" RENAME COLUMN \"a\" TO \"b\"");
            }
            other => panic!("expected RenameColumn, got {other:?}"),
        }
    }

    #[test]
    fn alter_column_type_is_cache_only() {
        match rewrite_ddl("alter table t alter column c set data type varchar(20)").unwrap() {
            LocalDdl::ChangeColumnType {
                column,
                ty,
                modifier,
                ..
            } => {
                assert_eq!(column, "c");
                assert_eq!(ty, ColType::Text);
                assert_eq!(modifier.as_deref(), Some("20"));
            }
            other => panic!("expected ChangeColumnType, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_statements_are_rejected() {
        assert!(matches!(
            rewrite_ddl("create index idx on t (a)"),
            Err(EdgeError::UnsupportedDdl(_))
        ));
        assert!(matches!(
            rewrite_ddl("alter table t rename to s"),
            Err(EdgeError::UnsupportedDdl(_))
        ));
        assert!(matches!(
            rewrite_ddl("vacuum full"),
            Err(EdgeError::UnsupportedDdl(_))
        ));
    }
}
