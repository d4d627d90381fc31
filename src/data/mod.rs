//! Data role: metadata client, data node, and the data-layer join protocol

pub mod client;
pub mod join;
pub mod server;

pub use client::MessagingClient;
pub use join::{join_or_initialize_data, DataMembership};
pub use server::{DataJoinReply, DataLayer, DataNode, DataNodeOptions};
