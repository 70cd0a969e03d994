//! Connections to the upstream primary.
//!
//! [`UpstreamConn`] drives the client side of the wire protocol: startup
//! (optionally in replication mode), authentication, and the simple-query
//! round trip. The replication consumer opens one in replication mode; the
//! front end forwards writes through an [`UpstreamPool`], which implements
//! the [`UpstreamWriter`] seam so sessions can be exercised without a
//! primary.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

use crate::auth::Authenticator;
use crate::config::UpstreamConfig;
use crate::error::{EdgeError, Result};
use crate::protocol::framing::{
    self, PROTOCOL_VERSION, read_backend_message, write_password_message, write_query,
    write_startup_message,
};
use crate::protocol::messages::{
    affected_rows, parse_auth_request, parse_command_complete, parse_data_row,
    parse_error_response, parse_row_description,
};

/// Result of one simple-query round trip.
#[derive(Debug, Default)]
pub struct SimpleQueryOutcome {
    pub command_tag: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<Bytes>>>,
}

/// A connected, authenticated session with the primary.
pub struct UpstreamConn {
    stream: TcpStream,
}

impl UpstreamConn {
    /// Connect and authenticate. With `replication` set, the session speaks
    /// the streaming-replication command set.
    pub async fn connect(cfg: &UpstreamConfig, replication: bool) -> Result<Self> {
        let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .await
            .map_err(|e| {
                EdgeError::UpstreamConnect(format!("{}:{}: {e}", cfg.host, cfg.port))
            })?;
        stream.set_nodelay(true)?;

        let mut conn = Self { stream };

        // Startup (protocol 3.0)
        let mut params = vec![
            ("user", cfg.user.as_str()),
            ("database", cfg.dbname.as_str()),
            ("client_encoding", "UTF8"),
            ("application_name", "pgwire-edge"),
        ];
        if replication {
            params.push(("replication", "database"));
        }
        write_startup_message(&mut conn.stream, PROTOCOL_VERSION, &params).await?;

        conn.authenticate(&cfg.user, &cfg.password).await?;
        Ok(conn)
    }

    /// Run one statement through the simple-query protocol and collect its
    /// result set and command tag.
    pub async fn simple_query(&mut self, sql: &str) -> Result<SimpleQueryOutcome> {
        write_query(&mut self.stream, sql).await?;

        let mut outcome = SimpleQueryOutcome::default();
        let mut server_error: Option<EdgeError> = None;

        loop {
            let msg = read_backend_message(&mut self.stream).await?;
            match msg.tag {
                b'T' => outcome.columns = parse_row_description(msg.payload)?,
                b'D' => outcome.rows.push(parse_data_row(msg.payload)?),
                b'C' => outcome.command_tag = Some(parse_command_complete(&msg.payload)),
                b'E' => {
                    // Drain until ReadyForQuery so the session stays usable.
                    server_error =
                        Some(EdgeError::UpstreamExec(parse_error_response(&msg.payload)));
                }
                b'Z' => {
                    return match server_error {
                        Some(err) => Err(err),
                        None => Ok(outcome),
                    };
                }
                // ParameterStatus, NoticeResponse, BackendKeyData,
                // EmptyQueryResponse, CopyInResponse rejection noise
                _ => {}
            }
        }
    }

    /// Execute a forwarded write; returns the affected-row count from the
    /// upstream command tag.
    pub async fn exec(&mut self, sql: &str) -> Result<u64> {
        let outcome = self.simple_query(sql).await?;
        Ok(outcome
            .command_tag
            .as_deref()
            .and_then(affected_rows)
            .unwrap_or(0))
    }

    /// Issue a replication command and wait for the copy-both handshake.
    /// After this returns, the stream carries CopyData in both directions.
    pub async fn start_copy_both(&mut self, sql: &str) -> Result<()> {
        write_query(&mut self.stream, sql).await?;
        loop {
            let msg = read_backend_message(&mut self.stream).await?;
            match msg.tag {
                b'W' => return Ok(()),
                b'E' => {
                    return Err(EdgeError::UpstreamConnect(parse_error_response(
                        &msg.payload,
                    )));
                }
                _ => {}
            }
        }
    }

    /// The underlying socket, for the replication streaming loop.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Drive the authentication exchange: each AuthenticationRequest goes
    /// through the [`Authenticator`] state machine, whose replies are sent
    /// back as PasswordMessages, until the server reports ReadyForQuery.
    async fn authenticate(&mut self, user: &str, password: &str) -> Result<()> {
        let mut auth = Authenticator::new(user, password);
        loop {
            let msg = read_backend_message(&mut self.stream).await?;
            match msg.tag {
                b'R' => {
                    let (code, rest) = parse_auth_request(&msg.payload)?;
                    if let Some(reply) = auth.step(code, rest)? {
                        write_password_message(&mut self.stream, &reply).await?;
                    }
                }
                b'E' => {
                    return Err(EdgeError::Auth(parse_error_response(&msg.payload)));
                }
                b'S' | b'K' => {}      // ParameterStatus, BackendKeyData
                b'Z' => return Ok(()), // ReadyForQuery
                _ => {}
            }
        }
    }

    /// Close the copy session politely; errors are irrelevant at this point.
    pub async fn close_copy(&mut self) {
        let _ = framing::write_copy_done(&mut self.stream).await;
    }
}

/// What the front end needs from the primary: statement execution with an
/// affected-row count.
#[async_trait]
pub trait UpstreamWriter: Send + Sync {
    async fn exec(&self, sql: &str) -> Result<u64>;
}

/// Lazily connecting, self-healing writer over one upstream session.
/// Forwarded writes are serialized; an I/O failure drops the session and the
/// statement is retried once on a fresh connection.
pub struct UpstreamPool {
    cfg: UpstreamConfig,
    conn: tokio::sync::Mutex<Option<UpstreamConn>>,
}

impl UpstreamPool {
    pub fn new(cfg: UpstreamConfig) -> Self {
        Self {
            cfg,
            conn: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl UpstreamWriter for UpstreamPool {
    async fn exec(&self, sql: &str) -> Result<u64> {
        let mut guard = self.conn.lock().await;

        for attempt in 0..2 {
            if guard.is_none() {
                *guard = Some(UpstreamConn::connect(&self.cfg, false).await?);
            }
            let conn = guard.as_mut().expect("connection just established");
            match conn.exec(sql).await {
                Ok(n) => return Ok(n),
                Err(err) if err.is_io() && attempt == 0 => {
                    tracing::warn!("upstream connection lost, reconnecting: {err}");
                    *guard = None;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("second attempt either returns or errors")
    }
}
