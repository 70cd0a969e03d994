//! Error types for pgwire-edge.
//!
//! All errors in this crate are represented by [`EdgeError`]. Variants fall
//! into three groups:
//! - connection-level failures (I/O, upstream connect, authentication,
//!   malformed frames),
//! - translation failures (unsupported types or DDL, row events without a
//!   usable key),
//! - local/upstream execution failures.
//!
//! Per-client-session errors become `ErrorResponse` frames and the session
//! survives. Replication-apply errors are retried with bounded backoff; on
//! exhaustion the replication loop aborts and the process exits non-zero.

use thiserror::Error;

/// Error type for all pgwire-edge operations.
#[derive(Debug, Error, Clone)]
pub enum EdgeError {
    /// Invalid or incomplete configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to establish the upstream connection.
    #[error("upstream connect error: {0}")]
    UpstreamConnect(String),

    /// Authentication against the upstream failed.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed replication or wire frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// pgoutput payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Type name or OID with no mapping in the type table.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// DDL statement outside the translated subset.
    #[error("unsupported ddl: {0}")]
    UnsupportedDdl(String),

    /// UPDATE for a table with no primary key or replica identity.
    #[error("update without key on table {0}")]
    UpdateWithoutKey(String),

    /// DELETE for a table with no primary key or replica identity.
    #[error("delete without key on table {0}")]
    DeleteWithoutKey(String),

    /// Local store rejected a replication-applied statement.
    #[error("local apply error: {0}")]
    LocalApply(String),

    /// Local store rejected a client read.
    #[error("local query error: {0}")]
    LocalQuery(String),

    /// Upstream rejected a forwarded statement.
    ///
    /// The message typically includes the SQLSTATE code.
    #[error("upstream exec error: {0}")]
    UpstreamExec(String),

    /// I/O error (network, file system).
    ///
    /// Note: `std::io::Error` is not `Clone`, so we store the message.
    #[error("io error: {0}")]
    Io(String),

    /// Operation interrupted by shutdown.
    #[error("cancelled")]
    Cancelled,
}

impl EdgeError {
    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io(&self) -> bool {
        matches!(self, EdgeError::Io(_))
    }

    /// Returns `true` if this error came from the upstream server.
    #[inline]
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            EdgeError::UpstreamConnect(_) | EdgeError::UpstreamExec(_)
        )
    }

    /// Returns `true` if this error is likely transient and retryable.
    ///
    /// Transient errors include I/O failures and local-apply failures (the
    /// store may be briefly locked). Non-transient errors (auth, unsupported
    /// types, protocol violations) require configuration or schema changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EdgeError::Io(_) | EdgeError::LocalApply(_) | EdgeError::UpstreamConnect(_)
        )
    }

    /// Reclassify a store error raised on the replication apply path.
    pub fn into_apply(self) -> EdgeError {
        match self {
            EdgeError::LocalQuery(msg) => EdgeError::LocalApply(msg),
            other => other,
        }
    }
}

// Manual From impls since neither source type is Clone.
impl From<std::io::Error> for EdgeError {
    fn from(err: std::io::Error) -> Self {
        EdgeError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for EdgeError {
    fn from(err: rusqlite::Error) -> Self {
        EdgeError::LocalQuery(err.to_string())
    }
}

/// Result type alias for pgwire-edge operations.
pub type Result<T> = std::result::Result<T, EdgeError>;
