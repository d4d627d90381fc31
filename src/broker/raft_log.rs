//! Replicated log participant
//!
//! `ReplicatedLog` is the contract the join protocol drives. `RaftLog` is a
//! disk-backed participant that persists membership state and talks to seeds
//! over the cluster HTTP surface. Leader election and log replication are not
//! implemented here: a sole member is its own leader, a joined member adopts
//! the leader reported by the seed that accepted it.

use crate::common::{endpoint, read_json, write_json_atomic, Error, ErrorBody, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Initialize,
    AddPeer,
    CreateDataNode,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Initialize => write!(f, "initialize"),
            EntryKind::AddPeer => write!(f, "add_peer"),
            EntryKind::CreateDataNode => write!(f, "create_data_node"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

/// State machine the log applies committed entries to.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry) -> Result<()>;

    fn applied_index(&self) -> u64;
}

/// Membership state of a log participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    Uninitialized,
    Initializing,
    Joined,
    LeaderUnknown,
}

impl std::fmt::Display for MembershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipState::Uninitialized => write!(f, "uninitialized"),
            MembershipState::Initializing => write!(f, "initializing"),
            MembershipState::Joined => write!(f, "joined"),
            MembershipState::LeaderUnknown => write!(f, "leader-unknown"),
        }
    }
}

/// Reply of a single join attempt against one seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogJoinReply {
    /// The seed accepted us into the cluster.
    Joined,
    /// The local log already holds state (an initialize won the race).
    AlreadyInitialized,
}

#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Identity this participant advertises.
    fn url(&self) -> Url;

    /// Last persisted (index, term); `(0, 0)` for a fresh log.
    fn last_index_term(&self) -> (u64, u64);

    fn state(&self) -> MembershipState;

    /// Currently known leader, if any.
    fn leader(&self) -> Option<Url>;

    /// Become the founding member of a new cluster.
    async fn initialize(&self) -> Result<()>;

    /// Ask `seed` to add this participant to its cluster.
    async fn join(&self, seed: &Url) -> Result<LogJoinReply>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub url: String,
}

/// Membership snapshot returned to a joining participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub cluster_id: Uuid,
    pub id: u64,
    pub term: u64,
    pub index: u64,
    pub leader: Option<String>,
    pub members: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStatus {
    pub url: String,
    pub cluster_id: Option<Uuid>,
    pub id: u64,
    pub index: u64,
    pub term: u64,
    pub state: MembershipState,
    pub leader: Option<String>,
    pub members: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedLog {
    cluster_id: Option<Uuid>,
    id: u64,
    term: u64,
    index: u64,
    leader: Option<String>,
    members: BTreeMap<u64, String>,
}

struct Inner {
    persisted: PersistedLog,
    state: MembershipState,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Per-request timeout for join calls to seeds
    pub request_timeout: Duration,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

pub struct RaftLog {
    url: Url,
    path: PathBuf,
    fsm: Arc<dyn StateMachine>,
    http: reqwest::Client,
    inner: Mutex<Inner>,
}

impl RaftLog {
    /// Open the log stored under `path`, advertising `url`.
    pub fn open(
        path: impl AsRef<Path>,
        url: Url,
        fsm: Arc<dyn StateMachine>,
        options: RaftOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(|e| Error::Open {
            what: "raft log",
            path: path.display().to_string(),
            source: Box::new(e.into()),
        })?;

        let mut persisted = read_json::<PersistedLog>(&path.join(STATE_FILE))?.unwrap_or_default();

        // A sole member elects itself; otherwise the leader must be rediscovered.
        let state = if persisted.index == 0 {
            MembershipState::Uninitialized
        } else if persisted.members.len() == 1
            && persisted.members.get(&persisted.id) == Some(&url.to_string())
        {
            persisted.leader = Some(url.to_string());
            MembershipState::Joined
        } else {
            persisted.leader = None;
            MembershipState::LeaderUnknown
        };

        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;

        tracing::debug!(
            path = %path.display(),
            index = persisted.index,
            term = persisted.term,
            state = %state,
            request_timeout_ms = options.request_timeout.as_millis() as u64,
            "raft log opened"
        );

        Ok(Self {
            url,
            path,
            fsm,
            http,
            inner: Mutex::new(Inner {
                persisted,
                state,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }

    /// Does this participant currently consider itself the leader?
    pub fn is_leader(&self) -> bool {
        self.inner().persisted.leader.as_deref() == Some(self.url.as_str())
    }

    /// Append an entry on the leader and apply it to the state machine.
    /// Returns the new index.
    pub fn append(&self, kind: EntryKind, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner();
        if inner.closed {
            return Err(Error::Closed("raft log".into()));
        }
        if inner.persisted.index == 0 {
            return Err(Error::NotInitialized("raft log".into()));
        }
        if inner.persisted.leader.as_deref() != Some(self.url.as_str()) {
            return Err(Error::NotLeader {
                leader: inner.persisted.leader.clone(),
            });
        }

        let mut next = inner.persisted.clone();
        next.index += 1;
        self.commit(&next, kind, data)?;
        inner.persisted = next;
        Ok(inner.persisted.index)
    }

    pub fn status(&self) -> LogStatus {
        let inner = self.inner();
        LogStatus {
            url: self.url.to_string(),
            cluster_id: inner.persisted.cluster_id,
            id: inner.persisted.id,
            index: inner.persisted.index,
            term: inner.persisted.term,
            state: inner.state,
            leader: inner.persisted.leader.clone(),
            members: inner.persisted.members.clone(),
        }
    }

    /// Accept a peer into this log's membership (`POST /raft/join`).
    ///
    /// A peer that is already a member gets its existing id back.
    pub fn handle_join(&self, peer: &Url) -> Result<JoinResponse> {
        let mut inner = self.inner();
        if inner.closed {
            return Err(Error::Closed("raft log".into()));
        }
        if inner.persisted.index == 0 {
            return Err(Error::NotInitialized("raft log".into()));
        }

        let peer = peer.to_string();
        let existing = inner
            .persisted
            .members
            .iter()
            .find(|(_, url)| **url == peer)
            .map(|(id, _)| *id);

        let id = match existing {
            Some(id) => id,
            None => {
                let mut next = inner.persisted.clone();
                let id = next.members.keys().next_back().copied().unwrap_or(0) + 1;
                next.members.insert(id, peer.clone());
                next.index += 1;
                self.commit(&next, EntryKind::AddPeer, peer.as_bytes())?;
                inner.persisted = next;
                tracing::info!(peer = %peer, id, index = inner.persisted.index, "raft log added member");
                id
            }
        };

        let persisted = &inner.persisted;
        let cluster_id = persisted
            .cluster_id
            .ok_or_else(|| Error::Internal("initialized log without cluster id".into()))?;
        Ok(JoinResponse {
            cluster_id,
            id,
            term: persisted.term,
            index: persisted.index,
            leader: persisted.leader.clone().or_else(|| Some(self.url.to_string())),
            members: persisted.members.clone(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `next` and apply the matching entry to the state machine.
    fn commit(&self, next: &PersistedLog, kind: EntryKind, data: &[u8]) -> Result<()> {
        write_json_atomic(&self.path.join(STATE_FILE), next)?;
        self.fsm.apply(&LogEntry {
            index: next.index,
            term: next.term,
            kind,
            data: data.to_vec(),
        })
    }
}

#[async_trait]
impl ReplicatedLog for RaftLog {
    fn url(&self) -> Url {
        self.url.clone()
    }

    fn last_index_term(&self) -> (u64, u64) {
        let inner = self.inner();
        (inner.persisted.index, inner.persisted.term)
    }

    fn state(&self) -> MembershipState {
        self.inner().state
    }

    fn leader(&self) -> Option<Url> {
        self.inner()
            .persisted
            .leader
            .as_deref()
            .and_then(|s| Url::parse(s).ok())
    }

    async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner();
        if inner.closed {
            return Err(Error::Closed("raft log".into()));
        }
        if inner.persisted.index != 0 {
            return Err(Error::AlreadyInitialized);
        }

        inner.state = MembershipState::Initializing;
        let url = self.url.to_string();
        let next = PersistedLog {
            cluster_id: Some(Uuid::new_v4()),
            id: 1,
            term: 1,
            index: 1,
            leader: Some(url.clone()),
            members: BTreeMap::from([(1, url.clone())]),
        };

        if let Err(e) = self.commit(&next, EntryKind::Initialize, url.as_bytes()) {
            inner.state = MembershipState::Uninitialized;
            return Err(e);
        }
        inner.persisted = next;
        inner.state = MembershipState::Joined;
        tracing::debug!(url = %url, "raft log initialized as sole member");
        Ok(())
    }

    async fn join(&self, seed: &Url) -> Result<LogJoinReply> {
        {
            let mut inner = self.inner();
            if inner.closed {
                return Err(Error::Closed("raft log".into()));
            }
            if inner.persisted.index != 0 {
                return Ok(LogJoinReply::AlreadyInitialized);
            }
            inner.state = MembershipState::Initializing;
        }

        let result = self.request_join(seed).await;

        let mut inner = self.inner();
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                if inner.persisted.index == 0 {
                    inner.state = MembershipState::Uninitialized;
                }
                return Err(e);
            }
        };

        // Someone initialized this log while the request was in flight.
        if inner.persisted.index != 0 {
            return Ok(LogJoinReply::AlreadyInitialized);
        }

        let next = PersistedLog {
            cluster_id: Some(resp.cluster_id),
            id: resp.id,
            term: resp.term,
            index: resp.index,
            leader: resp.leader,
            members: resp.members,
        };
        if let Err(e) = self.commit(&next, EntryKind::AddPeer, self.url.as_str().as_bytes()) {
            inner.state = MembershipState::Uninitialized;
            return Err(e);
        }
        inner.state = if next.leader.is_some() {
            MembershipState::Joined
        } else {
            MembershipState::LeaderUnknown
        };
        tracing::debug!(seed = %seed, id = next.id, index = next.index, "raft log joined");
        inner.persisted = next;
        Ok(LogJoinReply::Joined)
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner();
        if !inner.closed {
            inner.closed = true;
            tracing::info!(path = %self.path.display(), "raft log closed");
        }
        Ok(())
    }
}

impl RaftLog {
    async fn request_join(&self, seed: &Url) -> Result<JoinResponse> {
        let url = endpoint(seed, "raft/join")?;
        let resp = self
            .http
            .post(url.clone())
            .json(&JoinRequest {
                url: self.url.to_string(),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let (status, body) = ErrorBody::from_response(resp).await;
            return Err(body.into_error(status, &url));
        }
        Ok(resp.json::<JoinResponse>().await?)
    }
}
