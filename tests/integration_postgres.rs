#![cfg(feature = "integration-tests")]

//! Full-stack integration tests against a real PostgreSQL.
//!
//! Run with:
//! ```bash
//! cargo test --features integration-tests -- --nocapture
//! ```
//!
//! Spins up a primary in a container, runs the edge process wiring
//! (front end + replication consumer) against it, and drives everything
//! through a standard PostgreSQL client connected to the edge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerRequest, GenericImage, ImageExt, core::IntoContainerPort, core::WaitFor};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::info;

use pgwire_edge::server::{self, ServerContext};
use pgwire_edge::upstream::UpstreamPool;
use pgwire_edge::{
    Config, ListenConfig, LocalConfig, ReplicationConfig, SchemaCache, SqliteStore, UpstreamConfig,
    replication,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn get_available_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("get local addr")
        .port()
}

fn postgres_image(host_port: u16) -> ContainerRequest<GenericImage> {
    GenericImage::new("postgres", "16-alpine")
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_DB", "postgres")
        .with_cmd([
            "postgres",
            "-c",
            "wal_level=logical",
            "-c",
            "max_replication_slots=10",
            "-c",
            "max_wal_senders=10",
        ])
        .with_mapped_port(host_port, 5432.tcp())
}

fn edge_config(pg_port: u16, local_path: &std::path::Path, listen_port: u16) -> Config {
    Config {
        upstream: UpstreamConfig {
            host: "127.0.0.1".into(),
            port: pg_port,
            user: "postgres".into(),
            password: "postgres".into(),
            dbname: "postgres".into(),
            schema: "public".into(),
        },
        local: LocalConfig {
            path: local_path.to_path_buf(),
        },
        replication: ReplicationConfig {
            publication: "edge_itest_pub".into(),
            slot_name: "edge_itest_slot".into(),
            standby_timeout: Duration::from_secs(4),
            ..ReplicationConfig::default()
        },
        listen: ListenConfig {
            addr: format!("127.0.0.1:{listen_port}"),
        },
    }
}

/// Wire up the whole edge process in-test: store, cache, front end, and the
/// replication consumer. Returns the stop sender to tear it down.
async fn start_edge(cfg: Config) -> Result<watch::Sender<bool>> {
    let store = SqliteStore::open(&cfg.local.path)?;
    store.init_position_table()?;
    let catalog = store.catalog()?;
    let cache = Arc::new(SchemaCache::bootstrap(
        catalog.iter().map(|(n, s)| (n.as_str(), s.as_str())),
    )?);

    let (ddl_tx, mut ddl_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);

    let ctx = Arc::new(ServerContext {
        store: store.clone(),
        upstream: Arc::new(UpstreamPool::new(cfg.upstream.clone())),
        ddl_tx,
    });
    let listener = TcpListener::bind(&cfg.listen.addr).await?;
    tokio::spawn(server::serve(listener, ctx, stop_rx.clone()));

    tokio::spawn(async move {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            match replication::run(&cfg, store.clone(), cache.clone(), &mut ddl_rx, stop_rx.clone())
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    info!("replication attempt failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    });

    Ok(stop_tx)
}

async fn connect_edge(port: u16) -> Result<tokio_postgres::Client> {
    let (client, connection) = tokio_postgres::Config::new()
        .host("127.0.0.1")
        .port(port)
        .user("app")
        .dbname("postgres")
        .connect(tokio_postgres::NoTls)
        .await
        .context("connect to edge front end")?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

/// Poll a SELECT through the edge until it yields the expected number of
/// data rows or the deadline passes.
async fn wait_for_rows(
    client: &tokio_postgres::Client,
    sql: &str,
    want: usize,
    deadline: Duration,
) -> Result<Vec<tokio_postgres::SimpleQueryMessage>> {
    let start = Instant::now();
    loop {
        let messages = client.simple_query(sql).await?;
        let rows = messages
            .iter()
            .filter(|m| matches!(m, tokio_postgres::SimpleQueryMessage::Row(_)))
            .count();
        if rows == want {
            return Ok(messages);
        }
        if start.elapsed() > deadline {
            anyhow::bail!("timed out waiting for {want} rows from {sql} (got {rows})");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn first_row_value(messages: &[tokio_postgres::SimpleQueryMessage], column: usize) -> Option<String> {
    messages.iter().find_map(|m| match m {
        tokio_postgres::SimpleQueryMessage::Row(row) => {
            row.get(column).map(|value| value.to_string())
        }
        _ => None,
    })
}

#[tokio::test]
async fn ddl_and_dml_replicate_to_the_edge() -> Result<()> {
    init_tracing();

    let pg_port = get_available_port();
    let _container = postgres_image(pg_port).start().await?;

    let tmp = tempfile::tempdir()?;
    let listen_port = get_available_port();
    let cfg = edge_config(pg_port, &tmp.path().join("edge.db"), listen_port);
    let stop = start_edge(cfg).await?;

    // Give the replication consumer a moment to create slot + publication.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let client = connect_edge(listen_port).await?;

    // DDL forwards upstream and applies locally out of band.
    client
        .simple_query("create table items (id int primary key, label text)")
        .await?;

    // Writes forward upstream and come back through replication.
    client
        .simple_query("insert into items values (1, 'first')")
        .await?;
    let messages = wait_for_rows(
        &client,
        "select label from items where id = 1",
        1,
        Duration::from_secs(20),
    )
    .await?;
    assert_eq!(first_row_value(&messages, 0).as_deref(), Some("first"));

    client
        .simple_query("update items set label = 'second' where id = 1")
        .await?;
    let start = Instant::now();
    loop {
        let messages = client
            .simple_query("select label from items where id = 1")
            .await?;
        if first_row_value(&messages, 0).as_deref() == Some("second") {
            break;
        }
        if start.elapsed() > Duration::from_secs(20) {
            anyhow::bail!("update never replicated");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    client.simple_query("delete from items where id = 1").await?;
    wait_for_rows(
        &client,
        "select label from items where id = 1",
        0,
        Duration::from_secs(20),
    )
    .await?;

    let _ = stop.send(true);
    Ok(())
}

#[tokio::test]
async fn replication_resumes_from_persisted_position() -> Result<()> {
    init_tracing();

    let pg_port = get_available_port();
    let _container = postgres_image(pg_port).start().await?;

    let tmp = tempfile::tempdir()?;
    let db_path = tmp.path().join("edge.db");

    // First run: replicate one row, then stop the edge.
    let listen_port = get_available_port();
    let mut cfg = edge_config(pg_port, &db_path, listen_port);
    cfg.replication.manage_publication = true;
    let stop = start_edge(cfg.clone()).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let client = connect_edge(listen_port).await?;
    client
        .simple_query("create table events (id int primary key, note text)")
        .await?;
    client
        .simple_query("insert into events values (1, 'before restart')")
        .await?;
    wait_for_rows(
        &client,
        "select id from events",
        1,
        Duration::from_secs(20),
    )
    .await?;
    let _ = stop.send(true);
    drop(client);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Write directly upstream while the edge is down.
    let (pg, pg_conn) = tokio_postgres::Config::new()
        .host("127.0.0.1")
        .port(pg_port)
        .user("postgres")
        .password("postgres")
        .dbname("postgres")
        .connect(tokio_postgres::NoTls)
        .await?;
    tokio::spawn(async move {
        let _ = pg_conn.await;
    });
    pg.simple_query("insert into events values (2, 'while down')")
        .await?;

    // Second run against the same local file: the persisted position makes
    // the slot re-deliver only what the edge has not applied.
    let listen_port = get_available_port();
    let mut cfg = edge_config(pg_port, &db_path, listen_port);
    // The slot exists and is owned by this pipeline now.
    cfg.replication.manage_publication = false;
    let stop = start_edge(cfg).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let client = connect_edge(listen_port).await?;
    let messages = wait_for_rows(
        &client,
        "select id, note from events order by id",
        2,
        Duration::from_secs(20),
    )
    .await?;
    // No duplicates: exactly rows 1 and 2.
    assert_eq!(first_row_value(&messages, 0).as_deref(), Some("1"));

    let _ = stop.send(true);
    Ok(())
}
