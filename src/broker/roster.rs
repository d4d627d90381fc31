//! Cluster-wide data node roster
//!
//! Data nodes register with the brokers, not with each other. The roster is
//! part of the broker's state machine: a registration is appended to the
//! replicated log on the leader. A follower forwards the request to the leader
//! it knows about, at most one hop.

use crate::broker::raft_log::{EntryKind, RaftLog, ReplicatedLog};
use crate::broker::storage::Broker;
use crate::common::{endpoint, Error, ErrorBody, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Set on a registration a follower forwards to its leader.
pub const FORWARDED_HEADER: &str = "x-fluxnode-forwarded";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataNodeRequest {
    pub url: String,

    /// Register as the first data node of the cluster.
    #[serde(default)]
    pub initialize: bool,
}

/// Roster returned to a registering data node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeRoster {
    pub id: u64,
    pub nodes: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNodeList {
    pub leader: Option<String>,
    pub nodes: BTreeMap<u64, String>,
}

pub struct DataNodeRegistry {
    broker: Arc<Broker>,
    log: Arc<RaftLog>,
    http: reqwest::Client,
    // Serializes the empty-roster check with the append that follows it.
    write_lock: Mutex<()>,
}

impl DataNodeRegistry {
    pub fn new(broker: Arc<Broker>, log: Arc<RaftLog>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            broker,
            log,
            http,
            write_lock: Mutex::new(()),
        })
    }

    /// Roster as seen by the local broker.
    pub fn list(&self) -> DataNodeList {
        DataNodeList {
            leader: self.log.leader().map(|u| u.to_string()),
            nodes: self.broker.data_nodes(),
        }
    }

    /// Register a data node.
    ///
    /// A plain registration fails with `DataNodeNotFound` while the roster is
    /// empty: the caller is the first data node and must initialize instead.
    /// An initializing registration fails with `AlreadyInitialized` once
    /// another node holds the roster. A URL already on the roster gets its
    /// existing id back either way.
    pub async fn create(&self, req: &CreateDataNodeRequest, forwarded: bool) -> Result<DataNodeRoster> {
        let url = Url::parse(&req.url)
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", req.url, e)))?;

        if !self.log.is_leader() {
            return match self.log.leader() {
                Some(leader) if !forwarded => self.forward(&leader, req).await,
                leader => Err(Error::NotLeader {
                    leader: leader.map(|u| u.to_string()),
                }),
            };
        }

        let _guard = self.write_lock.lock().await;
        if let Some(id) = self.broker.data_node_id(url.as_str()) {
            return Ok(DataNodeRoster {
                id,
                nodes: self.broker.data_nodes(),
            });
        }

        let empty = self.broker.data_nodes().is_empty();
        if req.initialize && !empty {
            return Err(Error::AlreadyInitialized);
        }
        if !req.initialize && empty {
            return Err(Error::DataNodeNotFound);
        }

        let index = self
            .log
            .append(EntryKind::CreateDataNode, url.as_str().as_bytes())?;
        let id = self
            .broker
            .data_node_id(url.as_str())
            .ok_or_else(|| Error::Internal(format!("data node {} missing after apply", url)))?;
        tracing::info!(id, url = %url, index, "data node registered");

        Ok(DataNodeRoster {
            id,
            nodes: self.broker.data_nodes(),
        })
    }

    async fn forward(&self, leader: &Url, req: &CreateDataNodeRequest) -> Result<DataNodeRoster> {
        let target = endpoint(leader, "data_nodes")?;
        tracing::debug!(leader = %leader, url = %req.url, "forwarding data node registration");
        let resp = self
            .http
            .post(target.clone())
            .header(FORWARDED_HEADER, "1")
            .json(req)
            .send()
            .await?;

        if !resp.status().is_success() {
            let (status, body) = ErrorBody::from_response(resp).await;
            return Err(body.into_error(status, &target));
        }
        Ok(resp.json::<DataNodeRoster>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::raft_log::RaftOptions;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> (Arc<RaftLog>, DataNodeRegistry) {
        let broker = Arc::new(Broker::open(dir.path()).unwrap());
        let log = Arc::new(
            RaftLog::open(
                dir.path().join("raft"),
                Url::parse("http://node-a:8088").unwrap(),
                broker.clone(),
                RaftOptions::default(),
            )
            .unwrap(),
        );
        let registry = DataNodeRegistry::new(broker, log.clone(), Duration::from_secs(1)).unwrap();
        (log, registry)
    }

    fn request(url: &str, initialize: bool) -> CreateDataNodeRequest {
        CreateDataNodeRequest {
            url: url.to_string(),
            initialize,
        }
    }

    #[tokio::test]
    async fn test_first_node_initializes_then_others_join() {
        let dir = TempDir::new().unwrap();
        let (log, registry) = registry(&dir);
        log.initialize().await.unwrap();

        assert!(matches!(
            registry.create(&request("http://node-a:8088", false), false).await,
            Err(Error::DataNodeNotFound)
        ));

        let first = registry
            .create(&request("http://node-a:8088", true), false)
            .await
            .unwrap();
        assert_eq!(first.id, 1);

        let second = registry
            .create(&request("http://node-b:8088", false), false)
            .await
            .unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.nodes.len(), 2);

        // Known URL keeps its id, a late initializer is turned away
        let again = registry
            .create(&request("http://node-b:8088", true), false)
            .await
            .unwrap();
        assert_eq!(again.id, 2);
        assert!(matches!(
            registry.create(&request("http://node-c:8088", true), false).await,
            Err(Error::AlreadyInitialized)
        ));
        assert_eq!(registry.list().nodes.len(), 2);
        assert_eq!(log.last_index_term().0, 3);
    }

    #[tokio::test]
    async fn test_without_leader_registration_is_refused() {
        let dir = TempDir::new().unwrap();
        let (_log, registry) = registry(&dir);

        assert!(matches!(
            registry.create(&request("http://node-b:8088", false), false).await,
            Err(Error::NotLeader { leader: None })
        ));
        assert!(matches!(
            registry.create(&request("not a url", false), false).await,
            Err(Error::InvalidAddress(_))
        ));
    }
}
