//! Broker role: storage root, replicated log, data node roster, and the log
//! join protocol

pub mod join;
pub mod raft_log;
pub mod roster;
pub mod storage;

pub use join::{await_log_ready, join_or_initialize_log, LogMembership, LogReady};
pub use raft_log::{
    EntryKind, JoinRequest, JoinResponse, LogEntry, LogJoinReply, LogStatus, MembershipState,
    RaftLog, RaftOptions, ReplicatedLog, StateMachine,
};
pub use roster::{
    CreateDataNodeRequest, DataNodeList, DataNodeRegistry, DataNodeRoster, FORWARDED_HEADER,
};
pub use storage::Broker;
