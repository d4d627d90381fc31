//! Node bootstrap orchestrator
//!
//! Owns every subsystem handle and enforces the acquisition order:
//!
//! ```text
//! cluster + API listeners
//!   -> broker + raft log   (join or initialize)
//!   -> election grace      (LogReady, data role only)
//!   -> data node           (join or initialize, needs LogReady)
//!   -> admin server
//!   -> ingest servers
//! ```
//!
//! `close` releases in the reverse order. Any failure while closing stops the
//! teardown and is returned; the failed handle is kept so `close` can be
//! called again.

use crate::broker::{
    await_log_ready, join_or_initialize_log, Broker, DataNodeRegistry, LogMembership, LogReady,
    RaftLog, RaftOptions, ReplicatedLog,
};
use crate::common::{cluster_url, Config, Error, Result};
use crate::data::{
    join_or_initialize_data, DataLayer, DataMembership, DataNode, DataNodeOptions,
    MessagingClient,
};
use crate::node::admin::AdminServer;
use crate::node::http::{api_router, cluster_router, NodeState};
use crate::node::ingest::{IngestProtocol, IngestServer, LineSink};
use crate::node::listener::{FatalSender, Listener};
use crate::BuildInfo;
use reqwest::Url;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

const MESSAGING_CLIENT_FILE: &str = "messaging.json";

/// Outcome of a successful `Node::open`.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub cluster_url: Url,
    pub broker: Option<LogMembership>,
    pub data: Option<DataMembership>,
}

pub struct Node {
    config: Config,
    build: BuildInfo,
    state: NodeState,

    fatal_tx: FatalSender,
    fatal_rx: mpsc::UnboundedReceiver<Error>,

    cluster_listener: Option<Listener>,
    api_listener: Option<Listener>,
    broker: Option<Arc<Broker>>,
    raft_log: Option<Arc<RaftLog>>,
    data_node: Option<Arc<DataNode>>,
    admin_server: Option<AdminServer>,
    ingest_servers: Vec<IngestServer>,
}

impl Node {
    pub fn new(config: Config, build: BuildInfo) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let state = NodeState::new(config.hostname.clone(), build.clone());
        Self {
            config,
            build,
            state,
            fatal_tx,
            fatal_rx,
            cluster_listener: None,
            api_listener: None,
            broker: None,
            raft_log: None,
            data_node: None,
            admin_server: None,
            ingest_servers: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Bound address of the cluster listener.
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.cluster_listener.as_ref().map(|l| l.local_addr())
    }

    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_listener.as_ref().map(|l| l.local_addr())
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_server.as_ref().and_then(|s| s.local_addr())
    }

    pub fn ingest_addrs(&self) -> Vec<(IngestProtocol, SocketAddr)> {
        self.ingest_servers
            .iter()
            .filter_map(|s| s.local_addr().map(|addr| (s.protocol(), addr)))
            .collect()
    }

    /// URL other members use to reach this node: the configured hostname with
    /// the port the cluster listener actually bound.
    pub fn cluster_url(&self) -> Result<Url> {
        let addr = self
            .cluster_addr()
            .ok_or_else(|| Error::NotInitialized("cluster listener".into()))?;
        cluster_url(&self.config.hostname, addr)
    }

    pub fn broker(&self) -> Option<&Arc<Broker>> {
        self.broker.as_ref()
    }

    pub fn raft_log(&self) -> Option<&Arc<RaftLog>> {
        self.raft_log.as_ref()
    }

    pub fn data_node(&self) -> Option<&Arc<DataNode>> {
        self.data_node.as_ref()
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// Next fatal error raised by a background task (e.g. a listener whose
    /// serve loop died). `None` once the node is dropped.
    pub async fn fatal_error(&mut self) -> Option<Error> {
        self.fatal_rx.recv().await
    }

    /// Bring the node up. An error is fatal for bootstrap; call `close` to
    /// release whatever was acquired before it.
    pub async fn open(&mut self) -> Result<Bootstrap> {
        self.config.validate()?;
        let broker_seeds = self.config.broker_join_urls()?;
        let mut data_join_urls = self.config.data_join_urls()?;

        self.open_cluster_listener().await?;
        self.open_api_listener().await?;

        let url = self.cluster_url()?;
        self.state.set_cluster_url(url.clone()).await;
        tracing::info!(url = %url, hostname = %self.config.hostname, "cluster URL resolved");

        let broker = if self.config.broker.enabled {
            // The local broker is the data node's entry point when no peers are given.
            if data_join_urls.is_empty() {
                data_join_urls.push(url.clone());
            }
            Some(self.open_broker(&url, &broker_seeds).await?)
        } else {
            None
        };

        let data = if self.config.data.enabled {
            let ready = await_log_ready(
                self.raft_log
                    .as_deref()
                    .map(|log| log as &dyn ReplicatedLog),
                self.config.raft.election_grace(),
                self.config.raft.leader_poll_interval(),
            )
            .await;
            Some(self.open_data_node(&ready, &url, data_join_urls).await?)
        } else {
            None
        };

        if self.config.admin.enabled {
            self.open_admin_server().await?;
        }
        self.open_ingest_servers().await?;

        tracing::info!(url = %url, "node ready");
        Ok(Bootstrap {
            cluster_url: url,
            broker,
            data,
        })
    }

    async fn open_cluster_listener(&mut self) -> Result<()> {
        let router = cluster_router(self.state.clone());
        let listener = Listener::open(
            "Cluster",
            &self.config.cluster.bind_addr,
            router,
            self.fatal_tx.clone(),
        )
        .await?;
        self.cluster_listener = Some(listener);
        Ok(())
    }

    async fn open_api_listener(&mut self) -> Result<()> {
        let router = api_router(self.state.clone());
        let listener = Listener::open(
            "API",
            &self.config.api.bind_addr,
            router,
            self.fatal_tx.clone(),
        )
        .await?;
        self.api_listener = Some(listener);
        Ok(())
    }

    /// Open the broker, attach it as the state machine of the raft log, and
    /// run the log join protocol. The data node roster is served from here.
    async fn open_broker(&mut self, url: &Url, seeds: &[Url]) -> Result<LogMembership> {
        let dir = self.config.broker.dir.clone();
        let broker = Arc::new(Broker::open(&dir)?);
        tracing::info!(dir = %dir.display(), "broker opened");
        self.broker = Some(broker.clone());

        let timeout = self.config.raft.request_timeout();
        let log = Arc::new(RaftLog::open(
            self.config.raft_dir(),
            url.clone(),
            broker.clone(),
            RaftOptions {
                request_timeout: timeout,
            },
        )?);
        self.raft_log = Some(log.clone());
        self.state.attach_raft_log(log.clone()).await;

        let registry = DataNodeRegistry::new(broker, log.clone(), timeout)?;
        self.state.attach_registry(Arc::new(registry)).await;

        join_or_initialize_log(log.as_ref(), seeds).await
    }

    async fn open_data_node(
        &mut self,
        ready: &LogReady,
        url: &Url,
        join_urls: Vec<Url>,
    ) -> Result<DataMembership> {
        let dir = self.config.data.dir.clone();

        let mut client = MessagingClient::new(url.clone());
        client.set_urls(join_urls.clone());
        client.open(dir.join(MESSAGING_CLIENT_FILE))?;

        let options = DataNodeOptions {
            version: self.build.version.clone(),
            commit: self.build.commit.clone(),
            request_timeout: self.config.raft.request_timeout(),
        };
        let node = Arc::new(DataNode::open(&dir, client, options)?);
        self.data_node = Some(node.clone());
        self.state.attach_data_node(node.clone()).await;

        join_or_initialize_data(ready, node.as_ref(), url, &join_urls).await
    }

    async fn open_admin_server(&mut self) -> Result<()> {
        let mut admin = AdminServer::new(self.config.admin.bind_addr.clone(), self.state.clone());
        admin.listen_and_serve(self.fatal_tx.clone()).await?;
        self.admin_server = Some(admin);
        Ok(())
    }

    async fn open_ingest_servers(&mut self) -> Result<()> {
        let configured: Vec<_> = self
            .config
            .graphite
            .iter()
            .map(|c| (IngestProtocol::Graphite, c.clone()))
            .chain(
                self.config
                    .opentsdb
                    .iter()
                    .map(|c| (IngestProtocol::OpenTsdb, c.clone())),
            )
            .filter(|(_, c)| c.enabled)
            .collect();
        if configured.is_empty() {
            return Ok(());
        }

        let sink: Arc<dyn LineSink> = self
            .data_node
            .clone()
            .ok_or_else(|| Error::InvalidConfig("ingest servers require the data role".into()))?;
        for (protocol, config) in configured {
            let mut server = IngestServer::new(protocol, &config, sink.clone());
            server.listen_and_serve().await?;
            self.ingest_servers.push(server);
        }
        Ok(())
    }

    /// Close everything in reverse order of acquisition.
    ///
    /// Safe on a node that was never opened or is already closed.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(listener) = self.cluster_listener.as_mut() {
            listener
                .close()
                .await
                .map_err(|e| Error::close("cluster listener", e))?;
            self.cluster_listener = None;
        }

        if let Some(listener) = self.api_listener.as_mut() {
            listener
                .close()
                .await
                .map_err(|e| Error::close("API listener", e))?;
            self.api_listener = None;
        }

        if let Some(admin) = self.admin_server.as_mut() {
            admin
                .close()
                .await
                .map_err(|e| Error::close("admin server", e))?;
            self.admin_server = None;
        }

        while let Some(server) = self.ingest_servers.first_mut() {
            let protocol = server.protocol();
            server
                .close()
                .await
                .map_err(|e| Error::close(format!("{} server", protocol), e))?;
            self.ingest_servers.remove(0);
        }

        self.state.detach_all().await;

        if let Some(node) = self.data_node.as_ref() {
            node.close()
                .await
                .map_err(|e| Error::close("data node", e))?;
            self.data_node = None;
        }

        if let Some(log) = self.raft_log.as_ref() {
            log.close()
                .await
                .map_err(|e| Error::close("raft log", e))?;
            self.raft_log = None;
        }

        if let Some(broker) = self.broker.as_ref() {
            broker.close().map_err(|e| Error::close("broker", e))?;
            self.broker = None;
        }

        Ok(())
    }
}
