//! # pgwire-edge
//!
//! A Tokio-based edge read replica that speaks the PostgreSQL wire protocol.
//!
//! The process presents itself to clients as a PostgreSQL server while
//! serving reads from an embedded SQLite store and forwarding mutations to
//! the upstream primary. The store is kept eventually consistent through a
//! logical-replication session decoding the `pgoutput` stream.
//!
//! ## Features
//!
//! - **Async/await** - Built on Tokio for high-performance async I/O
//! - **Simple-query front end** - SELECTs served locally, writes and DDL
//!   forwarded upstream
//! - **pgoutput decoding** - Native logical replication applied
//!   transactionally with its replay position
//! - **SCRAM-SHA-256** - Secure password authentication against the primary
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pgwire_edge::{Config, SchemaCache, SqliteStore};
//! use pgwire_edge::server::{self, ServerContext};
//! use pgwire_edge::upstream::UpstreamPool;
//! use pgwire_edge::replication;
//! use tokio::net::TcpListener;
//! use tokio::sync::{mpsc, watch};
//!
//! # async fn example() -> pgwire_edge::Result<()> {
//! let cfg = Config::default();
//!
//! let store = SqliteStore::open(&cfg.local.path)?;
//! store.init_position_table()?;
//! let catalog = store.catalog()?;
//! let cache = Arc::new(SchemaCache::bootstrap(
//!     catalog.iter().map(|(n, s)| (n.as_str(), s.as_str())),
//! )?);
//!
//! let (ddl_tx, mut ddl_rx) = mpsc::unbounded_channel();
//! let (_stop_tx, stop_rx) = watch::channel(false);
//!
//! let ctx = Arc::new(ServerContext {
//!     store: store.clone(),
//!     upstream: Arc::new(UpstreamPool::new(cfg.upstream.clone())),
//!     ddl_tx,
//! });
//! let listener = TcpListener::bind(&cfg.listen.addr).await?;
//! tokio::spawn(server::serve(listener, ctx, stop_rx.clone()));
//!
//! replication::run(&cfg, store, cache, &mut ddl_rx, stop_rx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `scram` (default) - SCRAM-SHA-256 authentication
//! - `md5` - MD5 authentication (legacy)

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod config;
pub mod error;
pub mod lsn;
pub mod protocol;
pub mod replication;
pub mod schema;
pub mod server;
pub mod sqlgen;
pub mod store;
pub mod upstream;

pub use config::{Config, ListenConfig, LocalConfig, ReplicationConfig, UpstreamConfig};
pub use error::{EdgeError, Result};
pub use lsn::Lsn;
pub use protocol::pgoutput::ChangeEvent;
pub use schema::{ColType, SchemaCache, TableSchema};
pub use store::SqliteStore;
