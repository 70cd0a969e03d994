//! Per-connection client session.
//!
//! Startup handshake (SSLRequest -> `N`, then trust-auth startup), then the
//! simple-query loop. Classification is by first keyword: reads go to the
//! local store, everything else forwards upstream. Errors become
//! ErrorResponse frames and the session stays open; only malformed frames
//! close the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::protocol::backend::{self, FieldDesc};
use crate::protocol::framing::{StartupRequest, read_frontend_message, read_startup_request};
use crate::schema::ColType;
use crate::store::{QueryResult, ValueKind};

use super::ServerContext;

/// Per-client state captured at startup.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Startup parameters (user, database, application_name, ...).
    pub params: HashMap<String, String>,
    pub peer: SocketAddr,
}

/// How a statement is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryClass {
    /// SELECT or WITH ... SELECT: local store.
    Read,
    /// Forwarded to the primary.
    Write(WriteKind),
    /// Empty query string.
    Empty,
    /// Everything else is rejected.
    Unknown,
}

/// Forwarded statement kinds and their command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    CreateTable,
    AlterTable,
    DropTable,
}

impl WriteKind {
    /// True for statements that change the table layout and must reach the
    /// local store out of band.
    pub fn is_ddl(self) -> bool {
        matches!(
            self,
            WriteKind::CreateTable | WriteKind::AlterTable | WriteKind::DropTable
        )
    }

    fn command_tag(self, affected: u64) -> String {
        match self {
            WriteKind::Insert => format!("INSERT 0 {affected}"),
            WriteKind::Update => format!("UPDATE {affected}"),
            WriteKind::Delete => format!("DELETE {affected}"),
            WriteKind::CreateTable => "CREATE TABLE".into(),
            WriteKind::AlterTable => "ALTER TABLE".into(),
            WriteKind::DropTable => "DROP TABLE".into(),
        }
    }
}

/// Classify a statement by its first keyword, case-insensitively. A `WITH`
/// statement that eventually selects is a read.
pub fn classify(sql: &str) -> QueryClass {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return QueryClass::Empty;
    }
    let lowered = trimmed.to_lowercase();
    let mut words = lowered.split_whitespace();
    let first = words.next().unwrap_or_default();
    let second = words.next().unwrap_or_default();

    match first {
        "select" => QueryClass::Read,
        "with" if lowered.contains("select") => QueryClass::Read,
        "insert" => QueryClass::Write(WriteKind::Insert),
        "update" => QueryClass::Write(WriteKind::Update),
        "delete" => QueryClass::Write(WriteKind::Delete),
        "create" if second == "table" => QueryClass::Write(WriteKind::CreateTable),
        "alter" if second == "table" => QueryClass::Write(WriteKind::AlterTable),
        "drop" if second == "table" => QueryClass::Write(WriteKind::DropTable),
        _ => QueryClass::Unknown,
    }
}

/// Drive one client connection to completion.
pub async fn handle<S>(
    mut socket: S,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    stop_rx: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(state) = startup(&mut socket, peer).await? else {
        return Ok(());
    };
    trace!(%peer, user = state.params.get("user").map(String::as_str).unwrap_or("?"), "session ready");

    loop {
        // End the session after the current reply once shutdown starts.
        if *stop_rx.borrow() {
            return Ok(());
        }

        let msg = read_frontend_message(&mut socket).await?;
        match msg.tag {
            b'Q' => {
                let body = msg.payload;
                let end = body
                    .iter()
                    .position(|&x| x == 0)
                    .unwrap_or(body.len());
                let sql = String::from_utf8_lossy(&body[..end]).into_owned();
                dispatch(&mut socket, &sql, &ctx).await?;
            }
            b'X' => {
                debug!(%peer, "client terminated");
                return Ok(());
            }
            other => {
                // Extended-protocol and anything else: reply and close.
                warn!(%peer, tag = %(other as char), "unsupported frontend message");
                let mut buf = BytesMut::new();
                backend::error_response(
                    &mut buf,
                    &format!("unsupported message type: {}", other as char),
                );
                let _ = socket.write_all(&buf).await;
                return Ok(());
            }
        }
    }
}

/// Perform the startup handshake. Returns `None` when the connection ends
/// without a session (CancelRequest).
async fn startup<S>(socket: &mut S, peer: SocketAddr) -> Result<Option<SessionState>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        match read_startup_request(socket).await? {
            StartupRequest::Ssl => {
                // No TLS termination here, by design.
                socket.write_all(b"N").await?;
                socket.flush().await?;
            }
            StartupRequest::Cancel => {
                // Query cancellation is unimplemented; the key data we hand
                // out is fixed, so there is nothing to look up.
                debug!(%peer, "ignoring cancel request");
                return Ok(None);
            }
            StartupRequest::Startup { params } => {
                let mut buf = BytesMut::with_capacity(64);
                backend::authentication_ok(&mut buf);
                backend::backend_key_data(&mut buf);
                backend::ready_for_query(&mut buf);
                socket.write_all(&buf).await?;
                socket.flush().await?;

                return Ok(Some(SessionState {
                    params: params.into_iter().collect(),
                    peer,
                }));
            }
        }
    }
}

async fn dispatch<S>(socket: &mut S, sql: &str, ctx: &Arc<ServerContext>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut buf = BytesMut::new();

    match classify(sql) {
        QueryClass::Empty => {
            backend::empty_query_response(&mut buf);
            backend::ready_for_query(&mut buf);
        }
        QueryClass::Read => {
            trace!(%sql, "local read");
            match ctx.store.query(sql) {
                Ok(result) => encode_result(&mut buf, &result),
                Err(err) => {
                    backend::error_response(&mut buf, &err.to_string());
                    backend::ready_for_query(&mut buf);
                }
            }
        }
        QueryClass::Write(kind) => {
            trace!(%sql, ?kind, "forwarding upstream");
            match ctx.upstream.exec(sql).await {
                Ok(affected) => {
                    if kind.is_ddl() {
                        // Accepted by the primary; queue for local apply.
                        let _ = ctx.ddl_tx.send(sql.to_string());
                    }
                    backend::command_complete(&mut buf, &kind.command_tag(affected));
                    backend::ready_for_query(&mut buf);
                }
                Err(err) => {
                    backend::error_response(&mut buf, &err.to_string());
                    backend::ready_for_query(&mut buf);
                }
            }
        }
        QueryClass::Unknown => {
            backend::error_response(&mut buf, &format!("unknown query type: {sql}"));
            backend::ready_for_query(&mut buf);
        }
    }

    socket.write_all(&buf).await?;
    socket.flush().await?;
    Ok(())
}

/// Encode a materialized read: RowDescription, DataRows, empty command tag,
/// ReadyForQuery.
fn encode_result(buf: &mut BytesMut, result: &QueryResult) {
    let fields: Vec<FieldDesc> = result
        .columns
        .iter()
        .zip(&result.observed)
        .map(|(col, observed)| {
            let (type_oid, type_size) = column_type(col.decl_type.as_deref(), *observed).pg_type();
            FieldDesc {
                name: col.name.clone(),
                type_oid,
                type_size,
            }
        })
        .collect();

    backend::row_description(buf, &fields);
    for row in &result.rows {
        backend::data_row(buf, row);
    }
    backend::command_complete(buf, "");
    backend::ready_for_query(buf);
}

/// Resolve a result column's wire type: declared type first, then the
/// observed storage class for expression columns, text as the last resort.
fn column_type(decl: Option<&str>, observed: Option<ValueKind>) -> ColType {
    if let Some(ty) = decl.and_then(ColType::from_local_name) {
        return ty;
    }
    match observed {
        Some(ValueKind::Integer) => ColType::Int4,
        Some(ValueKind::Real) => ColType::Float8,
        Some(ValueKind::Blob) => ColType::Bytea,
        Some(ValueKind::Text) | None => ColType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_first_keyword() {
        assert_eq!(classify("SELECT 1"), QueryClass::Read);
        assert_eq!(classify("  select * from t;"), QueryClass::Read);
        assert_eq!(
            classify("WITH x AS (SELECT 1) SELECT * FROM x"),
            QueryClass::Read
        );
        assert_eq!(
            classify("insert into t values (1)"),
            QueryClass::Write(WriteKind::Insert)
        );
        assert_eq!(
            classify("Update t set a = 1"),
            QueryClass::Write(WriteKind::Update)
        );
        assert_eq!(
            classify("DELETE FROM t"),
            QueryClass::Write(WriteKind::Delete)
        );
        assert_eq!(
            classify("create table t (a int)"),
            QueryClass::Write(WriteKind::CreateTable)
        );
        assert_eq!(
            classify("alter table t add column c int"),
            QueryClass::Write(WriteKind::AlterTable)
        );
        assert_eq!(
            classify("drop table t"),
            QueryClass::Write(WriteKind::DropTable)
        );
    }

    #[test]
    fn non_subset_statements_are_unknown() {
        assert_eq!(classify("vacuum"), QueryClass::Unknown);
        assert_eq!(classify("create index i on t (a)"), QueryClass::Unknown);
        assert_eq!(classify("begin"), QueryClass::Unknown);
        assert_eq!(classify("with_table_fn()"), QueryClass::Unknown);
        assert_eq!(classify(""), QueryClass::Empty);
        assert_eq!(classify(" ; "), QueryClass::Empty);
    }

    #[test]
    fn command_tags_match_protocol() {
        assert_eq!(WriteKind::Insert.command_tag(3), "INSERT 0 3");
        assert_eq!(WriteKind::Update.command_tag(1), "UPDATE 1");
        assert_eq!(WriteKind::Delete.command_tag(0), "DELETE 0");
        assert_eq!(WriteKind::CreateTable.command_tag(0), "CREATE TABLE");
    }

    #[test]
    fn column_type_fallback_prefers_declaration() {
        assert_eq!(column_type(Some("int4"), None), ColType::Int4);
        assert_eq!(
            column_type(None, Some(ValueKind::Integer)),
            ColType::Int4
        );
        assert_eq!(column_type(None, Some(ValueKind::Real)), ColType::Float8);
        assert_eq!(column_type(None, None), ColType::Text);
    }
}
