//! Common utilities and types shared across fluxnode

pub mod config;
pub mod error;
pub mod utils;

pub use config::{
    AdminConfig, BrokerConfig, Config, DataConfig, IngestConfig, ListenerConfig, LoggingConfig,
    RaftConfig,
};
pub use error::{Error, ErrorBody, Result};
pub use utils::{
    cluster_url, endpoint, join_host_port, normalize_bind_addr, parse_urls, read_json,
    write_json_atomic,
};
