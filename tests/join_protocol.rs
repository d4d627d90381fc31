//! Join protocol tests against in-memory participants

use async_trait::async_trait;
use fluxnode::broker::{
    await_log_ready, join_or_initialize_log, LogJoinReply, LogMembership, MembershipState,
    ReplicatedLog,
};
use fluxnode::data::{join_or_initialize_data, DataJoinReply, DataLayer, DataMembership};
use fluxnode::{Error, Result};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

#[derive(Clone, Copy)]
enum SeedReply {
    Joined,
    AlreadyInitialized,
}

/// Log participant whose seeds answer from a script; unscripted seeds fail.
struct ScriptedLog {
    index: AtomicU64,
    replies: HashMap<String, SeedReply>,
    fail_initialize: bool,
    attempts: Mutex<Vec<Url>>,
    initialized: AtomicU64,
    leader: Option<Url>,
}

impl ScriptedLog {
    fn new(index: u64) -> Self {
        Self {
            index: AtomicU64::new(index),
            replies: HashMap::new(),
            fail_initialize: false,
            attempts: Mutex::new(Vec::new()),
            initialized: AtomicU64::new(0),
            leader: None,
        }
    }

    fn reply(mut self, seed: &str, reply: SeedReply) -> Self {
        self.replies.insert(url(seed).to_string(), reply);
        self
    }

    fn attempts(&self) -> Vec<Url> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicatedLog for ScriptedLog {
    fn url(&self) -> Url {
        url("http://self:8088")
    }

    fn last_index_term(&self) -> (u64, u64) {
        let index = self.index.load(Ordering::SeqCst);
        (index, if index == 0 { 0 } else { 1 })
    }

    fn state(&self) -> MembershipState {
        if self.index.load(Ordering::SeqCst) == 0 {
            MembershipState::Uninitialized
        } else {
            MembershipState::Joined
        }
    }

    fn leader(&self) -> Option<Url> {
        self.leader.clone()
    }

    async fn initialize(&self) -> Result<()> {
        if self.fail_initialize {
            return Err(Error::Internal("disk full".into()));
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        self.index.store(1, Ordering::SeqCst);
        Ok(())
    }

    async fn join(&self, seed: &Url) -> Result<LogJoinReply> {
        self.attempts.lock().unwrap().push(seed.clone());
        match self.replies.get(seed.as_str()) {
            Some(SeedReply::Joined) => {
                self.index.store(2, Ordering::SeqCst);
                Ok(LogJoinReply::Joined)
            }
            Some(SeedReply::AlreadyInitialized) => Ok(LogJoinReply::AlreadyInitialized),
            None => Err(Error::ConnectionFailed(format!("{} unreachable", seed))),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn seeds() -> Vec<Url> {
    vec![url("http://seed-1:8088"), url("http://seed-2:8088"), url("http://seed-3:8088")]
}

#[tokio::test]
async fn existing_log_ignores_seeds() {
    let log = ScriptedLog::new(5);
    let outcome = join_or_initialize_log(&log, &seeds()).await.unwrap();

    assert_eq!(outcome, LogMembership::Existing { index: 5, term: 1 });
    assert!(log.attempts().is_empty());
    assert_eq!(log.initialized.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn seeds_are_tried_in_order_until_one_accepts() {
    let log = ScriptedLog::new(0).reply("http://seed-3:8088", SeedReply::Joined);
    let outcome = join_or_initialize_log(&log, &seeds()).await.unwrap();

    assert_eq!(
        outcome,
        LogMembership::Joined {
            via: url("http://seed-3:8088")
        }
    );
    assert_eq!(log.attempts(), seeds());
    assert_eq!(log.initialized.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn already_initialized_stops_the_loop() {
    let log = ScriptedLog::new(0)
        .reply("http://seed-2:8088", SeedReply::AlreadyInitialized)
        .reply("http://seed-3:8088", SeedReply::Joined);
    let outcome = join_or_initialize_log(&log, &seeds()).await.unwrap();

    assert_eq!(
        outcome,
        LogMembership::AlreadyInitialized {
            via: url("http://seed-2:8088")
        }
    );
    assert_eq!(log.attempts(), seeds()[..2].to_vec());
}

#[tokio::test]
async fn exhausted_seeds_are_fatal() {
    let log = ScriptedLog::new(0);
    let err = join_or_initialize_log(&log, &seeds()).await.unwrap_err();

    assert!(matches!(
        err,
        Error::JoinExhausted {
            attempts: 3,
            ..
        }
    ));
    assert_eq!(log.attempts().len(), 3);
    assert_eq!(log.initialized.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn no_seeds_founds_the_cluster() {
    let log = ScriptedLog::new(0);
    let outcome = join_or_initialize_log(&log, &[]).await.unwrap();

    assert_eq!(outcome, LogMembership::Founded);
    assert!(log.attempts().is_empty());
    assert_eq!(log.initialized.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_initialize_is_fatal() {
    let mut log = ScriptedLog::new(0);
    log.fail_initialize = true;
    let err = join_or_initialize_log(&log, &[]).await.unwrap_err();

    assert!(matches!(err, Error::Initialize { layer: "raft log", .. }));
}

#[tokio::test]
async fn repeated_seed_is_tried_once() {
    let log = ScriptedLog::new(0).reply("http://seed-2:8088", SeedReply::Joined);
    let list = vec![
        url("http://seed-1:8088"),
        url("http://seed-1:8088"),
        url("http://seed-2:8088"),
    ];
    join_or_initialize_log(&log, &list).await.unwrap();

    assert_eq!(
        log.attempts(),
        vec![url("http://seed-1:8088"), url("http://seed-2:8088")]
    );
}

#[tokio::test]
async fn log_ready_returns_known_leader_immediately() {
    let mut log = ScriptedLog::new(1);
    log.leader = Some(url("http://leader:8088"));

    let ready = await_log_ready(Some(&log), Duration::from_secs(5), Duration::from_millis(10)).await;
    assert_eq!(ready.leader(), Some(&url("http://leader:8088")));
    assert!(ready.waited() < Duration::from_secs(5));
}

#[tokio::test]
async fn log_ready_gives_up_after_grace() {
    let log = ScriptedLog::new(3);
    let grace = Duration::from_millis(60);

    let ready = await_log_ready(Some(&log), grace, Duration::from_millis(10)).await;
    assert!(ready.leader().is_none());
    assert!(ready.waited() >= grace);
}

// === Data layer ===

#[derive(Clone, Copy)]
enum PeerReply {
    Joined(u64),
    NoDataNodes,
}

struct ScriptedDataNode {
    id: AtomicU64,
    replies: HashMap<String, PeerReply>,
    fail_initialize: bool,
    attempts: Mutex<Vec<Url>>,
    initialized_with: Mutex<Option<Url>>,
}

impl ScriptedDataNode {
    fn new(id: u64) -> Self {
        Self {
            id: AtomicU64::new(id),
            replies: HashMap::new(),
            fail_initialize: false,
            attempts: Mutex::new(Vec::new()),
            initialized_with: Mutex::new(None),
        }
    }

    fn reply(mut self, peer: &str, reply: PeerReply) -> Self {
        self.replies.insert(url(peer).to_string(), reply);
        self
    }

    fn attempts(&self) -> Vec<Url> {
        self.attempts.lock().unwrap().clone()
    }

    fn initialized_with(&self) -> Option<Url> {
        self.initialized_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataLayer for ScriptedDataNode {
    fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    async fn initialize(&self, self_url: &Url) -> Result<()> {
        if self.fail_initialize {
            return Err(Error::Internal("disk full".into()));
        }
        *self.initialized_with.lock().unwrap() = Some(self_url.clone());
        self.id.store(1, Ordering::SeqCst);
        Ok(())
    }

    async fn join(&self, _self_url: &Url, peer: &Url) -> Result<DataJoinReply> {
        self.attempts.lock().unwrap().push(peer.clone());
        match self.replies.get(peer.as_str()) {
            Some(PeerReply::Joined(id)) => {
                self.id.store(*id, Ordering::SeqCst);
                Ok(DataJoinReply::Joined { id: *id })
            }
            Some(PeerReply::NoDataNodes) => Ok(DataJoinReply::NoDataNodes),
            None => Err(Error::ConnectionFailed(format!("{} unreachable", peer))),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

async fn ready() -> fluxnode::broker::LogReady {
    await_log_ready(None, Duration::ZERO, Duration::from_millis(1)).await
}

fn self_url() -> Url {
    url("http://self:8088")
}

#[tokio::test]
async fn existing_data_node_ignores_join_urls() {
    let node = ScriptedDataNode::new(4);
    let outcome = join_or_initialize_data(&ready().await, &node, &self_url(), &seeds())
        .await
        .unwrap();

    assert_eq!(outcome, DataMembership::Existing { id: 4 });
    assert!(node.attempts().is_empty());
}

#[tokio::test]
async fn no_data_nodes_makes_us_the_first() {
    let node = ScriptedDataNode::new(0)
        .reply("http://seed-2:8088", PeerReply::NoDataNodes)
        .reply("http://seed-3:8088", PeerReply::Joined(9));
    let outcome = join_or_initialize_data(&ready().await, &node, &self_url(), &seeds())
        .await
        .unwrap();

    assert_eq!(outcome, DataMembership::Founded { id: 1 });
    assert_eq!(node.initialized_with(), Some(self_url()));
    assert_eq!(node.attempts(), seeds()[..2].to_vec());
}

#[tokio::test]
async fn data_node_joins_first_accepting_peer() {
    let node = ScriptedDataNode::new(0).reply("http://seed-2:8088", PeerReply::Joined(7));
    let outcome = join_or_initialize_data(&ready().await, &node, &self_url(), &seeds())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DataMembership::Joined {
            id: 7,
            via: url("http://seed-2:8088")
        }
    );
    assert!(node.initialized_with().is_none());
}

#[tokio::test]
async fn data_node_without_join_urls_initializes() {
    let node = ScriptedDataNode::new(0);
    let outcome = join_or_initialize_data(&ready().await, &node, &self_url(), &[])
        .await
        .unwrap();

    assert_eq!(outcome, DataMembership::Founded { id: 1 });
    assert!(node.attempts().is_empty());
}

#[tokio::test]
async fn data_node_exhaustion_is_fatal() {
    let node = ScriptedDataNode::new(0);
    let err = join_or_initialize_data(&ready().await, &node, &self_url(), &seeds())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::JoinExhausted {
            layer: "data node",
            attempts: 3
        }
    ));
    assert!(node.initialized_with().is_none());
}

#[tokio::test]
async fn first_node_initialize_failure_is_fatal() {
    let mut node = ScriptedDataNode::new(0).reply("http://seed-1:8088", PeerReply::NoDataNodes);
    node.fail_initialize = true;
    let err = join_or_initialize_data(&ready().await, &node, &self_url(), &seeds())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Initialize { layer: "data node", .. }));
    assert_eq!(node.attempts().len(), 1);
}
