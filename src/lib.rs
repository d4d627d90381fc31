//! # fluxnode
//!
//! Cluster bootstrap and membership for a node that runs a broker (replicated
//! log), a data node, or both:
//! - Join an existing cluster through an ordered list of seeds, or found one
//! - Persisted membership makes restarts ignore stale seed configuration
//! - Data node joins only after the broker had its election grace period
//! - Reverse-order shutdown of every subsystem
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Node                      │
//! │  cluster listener ─┐        API listener     │
//! │                    │                         │
//! │   ┌────────────────▼───┐   ┌──────────────┐  │
//! │   │ Broker + raft log  │──▶│  Data node   │  │
//! │   │ (join/initialize)  │   │ (join/init)  │  │
//! │   └────────────────────┘   └──────┬───────┘  │
//! │                                   │          │
//! │             admin server   ingest servers    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the first node of a cluster
//! ```bash
//! fluxnode run --config ./fluxnode.toml --hostname node-a
//! ```
//!
//! ### Join it from another node
//! ```bash
//! fluxnode run --hostname node-b --join http://node-a:8088
//! ```

pub mod broker;
pub mod common;
pub mod data;
pub mod node;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use node::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build identifiers handed to the node at construction.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: String,
    pub commit: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: VERSION.to_string(),
            commit: option_env!("FLUXNODE_COMMIT").unwrap_or("unknown").to_string(),
        }
    }
}
