//! Data node
//!
//! `DataLayer` is the contract the data-layer join protocol drives. `DataNode`
//! registers with the brokers over the cluster HTTP surface, persists the
//! identity and roster it was handed, and stores raw ingest lines.

use crate::broker::{CreateDataNodeRequest, DataNodeRoster};
use crate::common::{endpoint, read_json, write_json_atomic, Error, ErrorBody, Result};
use crate::data::client::MessagingClient;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const META_FILE: &str = "meta.json";
const INGEST_DIR: &str = "ingest";

/// Reply of a single join attempt against one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataJoinReply {
    /// The peer registered us and assigned `id`.
    Joined { id: u64 },
    /// The cluster has no data node roster: we are the first data node.
    NoDataNodes,
}

#[async_trait]
pub trait DataLayer: Send + Sync {
    /// Assigned identity; 0 means not yet assigned.
    fn id(&self) -> u64;

    /// Become the first data node, reachable at `self_url`.
    async fn initialize(&self, self_url: &Url) -> Result<()>;

    /// Register `self_url` with the cluster through `peer`.
    async fn join(&self, self_url: &Url, peer: &Url) -> Result<DataJoinReply>;

    async fn close(&self) -> Result<()>;
}

/// Options for opening a data node; build identifiers are passed in
/// explicitly rather than read from process globals.
#[derive(Debug, Clone)]
pub struct DataNodeOptions {
    pub version: String,
    pub commit: String,
    /// Timeout of a registration request to a broker
    pub request_timeout: Duration,
}

impl Default for DataNodeOptions {
    fn default() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            commit: "unknown".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DataMeta {
    id: u64,
    nodes: BTreeMap<u64, String>,
    version: String,
    /// Lines stored across restarts; flushed on close
    #[serde(default)]
    lines_written: u64,
}

pub struct DataNode {
    dir: PathBuf,
    options: DataNodeOptions,
    client: MessagingClient,
    http: reqwest::Client,
    meta: Mutex<DataMeta>,
    ingest_lock: tokio::sync::Mutex<()>,
    lines_written: AtomicU64,
    closed: AtomicBool,
}

impl DataNode {
    /// Open the data node stored under `dir` with an opened messaging client.
    pub fn open(
        dir: impl AsRef<Path>,
        client: MessagingClient,
        options: DataNodeOptions,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| Error::Open {
            what: "data node",
            path: dir.display().to_string(),
            source: Box::new(e.into()),
        })?;
        if client.urls().is_empty() {
            return Err(Error::NoBrokerUrls);
        }

        let mut meta = read_json::<DataMeta>(&dir.join(META_FILE))?.unwrap_or_default();
        if meta.version != options.version {
            tracing::debug!(from = %meta.version, to = %options.version, "data node version changed");
            meta.version = options.version.clone();
        }

        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;

        tracing::info!(
            id = meta.id,
            dir = %dir.display(),
            version = %options.version,
            commit = %options.commit,
            "data node opened"
        );

        let lines_written = meta.lines_written;
        Ok(Self {
            dir,
            options,
            client,
            http,
            meta: Mutex::new(meta),
            ingest_lock: tokio::sync::Mutex::new(()),
            lines_written: AtomicU64::new(lines_written),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &DataNodeOptions {
        &self.options
    }

    pub fn client(&self) -> &MessagingClient {
        &self.client
    }

    /// Roster as of this node's last registration.
    pub fn nodes(&self) -> BTreeMap<u64, String> {
        self.meta().nodes.clone()
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Append raw ingest lines for `database`. Parsing happens downstream.
    pub async fn write_lines(&self, database: &str, lines: &[String]) -> Result<usize> {
        self.ensure_open()?;
        if self.id() == 0 {
            return Err(Error::NotInitialized("data node".into()));
        }
        if database.is_empty()
            || database.contains(['/', '\\'])
            || database.starts_with('.')
        {
            return Err(Error::InvalidConfig(format!("invalid database name: {:?}", database)));
        }
        if lines.is_empty() {
            return Ok(0);
        }

        let dir = self.dir.join(INGEST_DIR);
        let _guard = self.ingest_lock.lock().await;
        tokio::fs::create_dir_all(&dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.lines", database)))
            .await?;

        let mut buf = String::new();
        for line in lines {
            buf.push_str(line.trim_end());
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        self.lines_written
            .fetch_add(lines.len() as u64, Ordering::Relaxed);
        tracing::debug!(database, lines = lines.len(), "ingest lines written");
        Ok(lines.len())
    }

    fn meta(&self) -> MutexGuard<'_, DataMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("data node".into()));
        }
        Ok(())
    }

    fn persist(&self, next: DataMeta) -> Result<()> {
        let mut meta = self.meta();
        write_json_atomic(&self.dir.join(META_FILE), &next)?;
        *meta = next;
        Ok(())
    }

    /// Take the identity and roster a broker handed out.
    fn adopt(&self, roster: DataNodeRoster) -> Result<()> {
        let current = self.meta().clone();
        self.persist(DataMeta {
            id: roster.id,
            nodes: roster.nodes,
            ..current
        })
    }

    async fn register(&self, self_url: &Url, broker: &Url, initialize: bool) -> Result<DataNodeRoster> {
        let url = endpoint(broker, "data_nodes")?;
        let resp = self
            .http
            .post(url.clone())
            .json(&CreateDataNodeRequest {
                url: self_url.to_string(),
                initialize,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            let (status, body) = ErrorBody::from_response(resp).await;
            return Err(body.into_error(status, &url));
        }
        Ok(resp.json::<DataNodeRoster>().await?)
    }
}

#[async_trait]
impl DataLayer for DataNode {
    fn id(&self) -> u64 {
        self.meta().id
    }

    /// Register as the first data node with the first broker that answers.
    async fn initialize(&self, self_url: &Url) -> Result<()> {
        self.ensure_open()?;
        if self.id() != 0 {
            return Err(Error::AlreadyInitialized);
        }

        let mut last_err = Error::NoBrokerUrls;
        for broker in self.client.urls() {
            match self.register(self_url, broker, true).await {
                Ok(roster) => return self.adopt(roster),
                Err(Error::AlreadyInitialized) => return Err(Error::AlreadyInitialized),
                Err(e) => {
                    tracing::warn!(broker = %broker, error = %e, "data node initialize request failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn join(&self, self_url: &Url, peer: &Url) -> Result<DataJoinReply> {
        self.ensure_open()?;
        if self.id() != 0 {
            return Err(Error::AlreadyInitialized);
        }

        match self.register(self_url, peer, false).await {
            Ok(roster) => {
                let id = roster.id;
                self.adopt(roster)?;
                Ok(DataJoinReply::Joined { id })
            }
            Err(Error::DataNodeNotFound) => Ok(DataJoinReply::NoDataNodes),
            Err(e) => Err(e),
        }
    }

    /// Flush the line counter. The node stays open when the flush fails.
    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let _guard = self.ingest_lock.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        let current = self.meta().clone();
        self.persist(DataMeta {
            lines_written: self.lines_written(),
            ..current
        })?;
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!(dir = %self.dir.display(), "data node closed");
        Ok(())
    }
}
