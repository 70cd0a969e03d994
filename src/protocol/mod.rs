//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for both roles this process
//! plays:
//! - As a *client* of the primary: writing frontend messages and reading
//!   backend messages ([`framing`], [`messages`]), handling streaming
//!   replication frames ([`replication`]) and decoding their pgoutput
//!   payloads ([`pgoutput`]).
//! - As a *server* to edge applications: reading frontend messages and
//!   building backend replies ([`framing`], [`backend`]).
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: Startup and SSL request messages omit the type tag.
//!
//! # Replication Protocol
//!
//! During logical replication, the server sends CopyData messages containing
//! either `XLogData` (WAL changes) or `KeepAlive` (heartbeats). The client
//! responds with `StandbyStatusUpdate` messages to report replay progress.

pub mod backend;
pub mod framing;
pub mod messages;
pub mod pgoutput;
pub mod replication;

pub use framing::{BackendMessage, FrontendMessage, StartupRequest};
pub use messages::{parse_auth_request, parse_error_response};
pub use pgoutput::{ChangeEvent, RelationColumn, RelationDesc, TupleData, TupleValue};
pub use replication::{
    ReplicationCopyData, encode_standby_status_update, parse_copy_data, pg_epoch_micros,
};
