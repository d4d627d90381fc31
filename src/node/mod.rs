//! Node orchestration
//!
//! The node owns the network-facing subsystems and sequences the broker and
//! data roles:
//! - Listener management for the cluster and API ports
//! - Cluster HTTP surface used by joining members
//! - Admin and ingest servers
//! - Startup and reverse-order shutdown

pub mod admin;
pub mod http;
pub mod ingest;
pub mod listener;
pub mod server;
pub mod shutdown;

pub use listener::{FatalSender, Listener};
pub use server::{Bootstrap, Node};
pub use shutdown::shutdown_signal;
