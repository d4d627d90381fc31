//! Auxiliary ingest servers
//!
//! Graphite and OpenTSDB both speak newline-delimited text over TCP. Lines are
//! handed to the data node unparsed; protocol parsing happens downstream.

use crate::common::{normalize_bind_addr, Error, IngestConfig, Result};
use crate::data::DataNode;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestProtocol {
    Graphite,
    OpenTsdb,
}

impl IngestProtocol {
    /// Listen address used when an entry leaves `bind_addr` empty.
    pub fn default_bind_addr(self) -> &'static str {
        match self {
            IngestProtocol::Graphite => ":2003",
            IngestProtocol::OpenTsdb => ":4242",
        }
    }
}

impl std::fmt::Display for IngestProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestProtocol::Graphite => write!(f, "graphite"),
            IngestProtocol::OpenTsdb => write!(f, "opentsdb"),
        }
    }
}

/// Destination for ingested lines.
#[async_trait]
pub trait LineSink: Send + Sync {
    async fn write_lines(&self, database: &str, lines: &[String]) -> Result<usize>;
}

#[async_trait]
impl LineSink for DataNode {
    async fn write_lines(&self, database: &str, lines: &[String]) -> Result<usize> {
        DataNode::write_lines(self, database, lines).await
    }
}

pub struct IngestServer {
    protocol: IngestProtocol,
    addr: String,
    database: String,
    sink: Arc<dyn LineSink>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl IngestServer {
    pub fn new(protocol: IngestProtocol, config: &IngestConfig, sink: Arc<dyn LineSink>) -> Self {
        let addr = if config.bind_addr.trim().is_empty() {
            protocol.default_bind_addr().to_string()
        } else {
            config.bind_addr.clone()
        };
        Self {
            protocol,
            addr,
            database: config.database.clone(),
            sink,
            local_addr: None,
            shutdown: None,
            task: None,
        }
    }

    pub fn protocol(&self) -> IngestProtocol {
        self.protocol
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn listen_and_serve(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let bind_addr = normalize_bind_addr(&self.addr);
        let desc = self.protocol.to_string();
        let tcp = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| Error::Bind {
                desc: desc.clone(),
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = tcp.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let conn = Connection {
            protocol: self.protocol,
            database: self.database.clone(),
            sink: self.sink.clone(),
        };
        self.task = Some(tokio::spawn(accept_loop(tcp, conn, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        tracing::info!(protocol = %self.protocol, addr = %local_addr, database = %self.database, "ingest server listening");
        Ok(())
    }

    /// Stop accepting and drop open connections. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => {
                return Err(Error::Internal(format!("{} server task: {}", self.protocol, e)));
            }
            Err(_) => task.abort(),
        }
        tracing::info!(protocol = %self.protocol, "ingest server closed");
        self.local_addr = None;
        Ok(())
    }
}

impl Drop for IngestServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
struct Connection {
    protocol: IngestProtocol,
    database: String,
    sink: Arc<dyn LineSink>,
}

async fn accept_loop(tcp: TcpListener, conn: Connection, mut shutdown: watch::Receiver<bool>) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            accepted = tcp.accept() => match accepted {
                Ok((stream, peer)) => {
                    conns.spawn(serve_connection(stream, peer, conn.clone(), shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!(protocol = %conn.protocol, error = %e, "ingest accept failed");
                }
            },
        }
    }
    conns.shutdown().await;
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn: Connection,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(stream).lines();
    let mut received = 0u64;
    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "ingest connection read failed");
                    break;
                }
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        received += 1;
        if let Err(e) = conn.sink.write_lines(&conn.database, &[line]).await {
            tracing::warn!(protocol = %conn.protocol, %peer, error = %e, "ingest write failed");
        }
    }
    tracing::debug!(protocol = %conn.protocol, %peer, received, "ingest connection closed");
}
