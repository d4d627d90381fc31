//! Configuration for fluxnode

use crate::common::utils::parse_urls;
use crate::common::{Error, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hostname advertised to other cluster members
    pub hostname: String,

    pub cluster: ListenerConfig,

    pub api: ListenerConfig,

    pub broker: BrokerConfig,

    pub raft: RaftConfig,

    pub data: DataConfig,

    pub admin: AdminConfig,

    /// Graphite ingest servers (zero or more)
    pub graphite: Vec<IngestConfig>,

    /// OpenTSDB ingest servers (zero or more)
    pub opentsdb: Vec<IngestConfig>,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            cluster: ListenerConfig {
                bind_addr: ":8088".to_string(),
            },
            api: ListenerConfig {
                bind_addr: ":8086".to_string(),
            },
            broker: BrokerConfig::default(),
            raft: RaftConfig::default(),
            data: DataConfig::default(),
            admin: AdminConfig::default(),
            graphite: Vec::new(),
            opentsdb: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// `host:port`, or `:port` for all interfaces
    pub bind_addr: String,
}

/// Broker (replicated log) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,

    /// Broker storage root; the raft log lives in `<dir>/raft`
    pub dir: PathBuf,

    /// Seed URLs tried in order when the log holds no state
    pub join_urls: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./fluxnode-data/broker"),
            join_urls: Vec::new(),
        }
    }
}

/// Raft timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Timeout of a single join, registration, or forwarded request to a peer
    pub request_timeout_ms: u64,

    /// Upper bound on the wait for a known leader before the data layer joins
    pub election_grace_ms: u64,

    /// How often the leader readiness check polls the log
    pub leader_poll_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            election_grace_ms: 1000,
            leader_poll_interval_ms: 50,
        }
    }
}

impl RaftConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn election_grace(&self) -> Duration {
        Duration::from_millis(self.election_grace_ms)
    }

    pub fn leader_poll_interval(&self) -> Duration {
        Duration::from_millis(self.leader_poll_interval_ms.max(1))
    }
}

/// Data node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub enabled: bool,
    pub dir: PathBuf,

    /// Peer URLs tried in order when the data node has no identity
    pub join_urls: Vec<String>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./fluxnode-data/data"),
            join_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind_addr: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: ":8083".to_string(),
        }
    }
}

/// A single ingest server entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,
    pub bind_addr: String,

    /// Target database for ingested lines
    pub database: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: String::new(),
            database: "fluxnode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub raft_tracing: bool,
    pub write_tracing: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            raft_tracing: false,
            write_tracing: false,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `FLUXNODE_*`
    /// environment variables (`FLUXNODE_BROKER__JOIN_URLS=a,b`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FLUXNODE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("broker.join_urls")
                .with_list_parse_key("data.join_urls"),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject role combinations the node cannot bootstrap.
    pub fn validate(&self) -> Result<()> {
        if !self.broker.enabled && !self.data.enabled {
            return Err(Error::InvalidConfig(
                "at least one of broker or data must be enabled".into(),
            ));
        }
        let ingest_enabled = self
            .graphite
            .iter()
            .chain(self.opentsdb.iter())
            .any(|c| c.enabled);
        if ingest_enabled && !self.data.enabled {
            return Err(Error::InvalidConfig(
                "ingest servers require the data role".into(),
            ));
        }
        if self.hostname.is_empty() {
            return Err(Error::InvalidConfig("hostname must not be empty".into()));
        }
        self.broker_join_urls()?;
        self.data_join_urls()?;
        Ok(())
    }

    pub fn broker_join_urls(&self) -> Result<Vec<Url>> {
        parse_urls(&self.broker.join_urls)
    }

    pub fn data_join_urls(&self) -> Result<Vec<Url>> {
        parse_urls(&self.data.join_urls)
    }

    /// Path to the raft log inside the broker directory.
    pub fn raft_dir(&self) -> PathBuf {
        self.broker.dir.join("raft")
    }

    /// Render as TOML (for `fluxnode config`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.raft.election_grace(), Duration::from_secs(1));
        assert_eq!(config.raft.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.raft_dir(), PathBuf::from("./fluxnode-data/broker/raft"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
hostname = "node-a"

[raft]
request_timeout_ms = 750

[broker]
join_urls = ["http://node-b:8088", "http://node-c:8088"]

[[graphite]]
enabled = true
bind_addr = ":2003"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.hostname, "node-a");
        assert_eq!(config.broker_join_urls().unwrap().len(), 2);
        assert_eq!(config.graphite.len(), 1);
        assert_eq!(config.graphite[0].database, "fluxnode");
        assert_eq!(config.api.bind_addr, ":8086");
        assert_eq!(config.raft.request_timeout(), Duration::from_millis(750));
    }

    #[test]
    fn test_validate_rejects_bad_roles() {
        let mut config = Config::default();
        config.broker.enabled = false;
        config.data.enabled = false;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.broker.enabled = false;
        config.data.join_urls = vec!["http://broker:8088".into()];
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.data.enabled = false;
        config.opentsdb.push(IngestConfig {
            enabled: true,
            bind_addr: ":4242".into(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config = Config::default();
        config.broker.join_urls = vec!["not a url".into()];
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_defaults_render_as_toml() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[broker]"));
        assert!(rendered.contains("election_grace_ms = 1000"));
    }
}
