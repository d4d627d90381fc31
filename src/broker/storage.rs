//! Broker storage root
//!
//! The broker owns the on-disk directory the raft log lives in and acts as the
//! log's state machine. Topic/segment storage is not modelled; the broker
//! tracks the last applied index and the cluster's data node roster, which
//! is what data nodes register against when they join.

use crate::broker::raft_log::{EntryKind, LogEntry, StateMachine};
use crate::common::{read_json, write_json_atomic, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const META_FILE: &str = "broker.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BrokerMeta {
    applied_index: u64,
    applied_term: u64,
    #[serde(default)]
    data_nodes: BTreeMap<u64, String>,
}

pub struct Broker {
    dir: PathBuf,
    meta: Mutex<BrokerMeta>,
    closed: AtomicBool,
}

impl Broker {
    /// Open or create the broker directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Open {
            what: "broker",
            path: dir.display().to_string(),
            source: Box::new(e.into()),
        })?;
        let meta = read_json::<BrokerMeta>(&dir.join(META_FILE))?.unwrap_or_default();

        tracing::debug!(
            dir = %dir.display(),
            applied_index = meta.applied_index,
            data_nodes = meta.data_nodes.len(),
            "broker storage loaded"
        );

        Ok(Self {
            dir,
            meta: Mutex::new(meta),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Data nodes registered through the log, by id.
    pub fn data_nodes(&self) -> BTreeMap<u64, String> {
        self.meta().data_nodes.clone()
    }

    pub fn data_node_id(&self, url: &str) -> Option<u64> {
        self.meta()
            .data_nodes
            .iter()
            .find(|(_, u)| u.as_str() == url)
            .map(|(id, _)| *id)
    }

    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(dir = %self.dir.display(), "broker closed");
        Ok(())
    }

    fn meta(&self) -> MutexGuard<'_, BrokerMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateMachine for Broker {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("broker".into()));
        }
        let mut meta = self.meta();
        // Replays of already-applied entries are ignored.
        if entry.index <= meta.applied_index {
            return Ok(());
        }

        let data_node = match entry.kind {
            EntryKind::CreateDataNode => Some(std::str::from_utf8(&entry.data).map_err(|e| {
                Error::Internal(format!("data node entry {}: {}", entry.index, e))
            })?),
            EntryKind::Initialize | EntryKind::AddPeer => None,
        };

        let previous = meta.clone();
        meta.applied_index = entry.index;
        meta.applied_term = entry.term;
        if let Some(url) = data_node {
            if !meta.data_nodes.values().any(|u| u == url) {
                let id = meta.data_nodes.keys().next_back().copied().unwrap_or(0) + 1;
                meta.data_nodes.insert(id, url.to_string());
                tracing::debug!(id, url, "broker registered data node");
            }
        }

        if let Err(e) = write_json_atomic(&self.dir.join(META_FILE), &*meta) {
            *meta = previous;
            return Err(e);
        }
        tracing::debug!(index = entry.index, kind = %entry.kind, "broker applied entry");
        Ok(())
    }

    fn applied_index(&self) -> u64 {
        self.meta().applied_index
    }
}
