use std::path::PathBuf;
use std::time::Duration;

/// Connection parameters for the upstream primary.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    /// Default schema on the primary; qualified names are collapsed to it.
    pub schema: String,
}

/// Location of the embedded store.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub path: PathBuf,
}

/// Logical-replication session parameters.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub publication: String,
    pub slot_name: String,
    /// Output plugin on the slot. `pgoutput` is the only decoded plugin.
    pub plugin: String,
    /// Attempt CREATE_REPLICATION_SLOT at startup; an existing slot is reused.
    pub create_slot_if_not_exists: bool,
    /// Temporary slots are dropped by the server on disconnect.
    pub temporary: bool,
    /// Server-side wal_sender_timeout equivalent; status updates are sent at
    /// half this interval.
    pub standby_timeout: Duration,
    /// Drop and recreate the publication at startup. Safe only when this
    /// process owns the publication exclusively.
    pub manage_publication: bool,
    /// If no server messages arrive within this interval, treat it as an error.
    pub idle_timeout: Duration,
}

/// Listening socket for the wire front end.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub addr: String,
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub local: LocalConfig,
    pub replication: ReplicationConfig,
    pub listen: ListenConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            dbname: "postgres".into(),
            schema: "public".into(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("edge.db"),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            publication: "edge_pub".into(),
            slot_name: "edge_slot".into(),
            plugin: "pgoutput".into(),
            create_slot_if_not_exists: true,
            temporary: false,
            standby_timeout: Duration::from_secs(20),
            manage_publication: true,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5433".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            local: LocalConfig::default(),
            replication: ReplicationConfig::default(),
            listen: ListenConfig::default(),
        }
    }
}
