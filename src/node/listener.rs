//! Listener manager
//!
//! Binds a TCP listener and serves an axum router on a background task. An
//! orderly close ends the serve loop quietly; any other serve failure is
//! reported on the fatal channel, since a silently dead listener would leave
//! the node unreachable without anyone noticing.

use crate::common::{normalize_bind_addr, Error, Result};
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Receives errors that must stop the node.
pub type FatalSender = mpsc::UnboundedSender<Error>;

/// How long `close` waits for in-flight requests before aborting the task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Listener {
    desc: String,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `addr` and serve `router` until closed.
    pub async fn open(desc: &str, addr: &str, router: Router, fatal: FatalSender) -> Result<Self> {
        let bind_addr = normalize_bind_addr(addr);
        let tcp = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| Error::Bind {
                desc: desc.to_string(),
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = tcp.local_addr().map_err(|source| Error::Bind {
            desc: desc.to_string(),
            addr: bind_addr.clone(),
            source,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_desc = desc.to_string();
        let task = tokio::spawn(async move {
            let served = axum::serve(tcp, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(source) = served {
                tracing::error!(listener = %task_desc, addr = %local_addr, error = %source, "listener failed");
                let _ = fatal.send(Error::Serve {
                    desc: task_desc,
                    addr: local_addr.to_string(),
                    source,
                });
            }
        });

        tracing::info!(listener = desc, addr = %local_addr, "listener opened");
        Ok(Self {
            desc: desc.to_string(),
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Address actually bound (resolves `:0` to the OS-assigned port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn is_open(&self) -> bool {
        self.task.is_some()
    }

    /// Stop serving. Closing an already closed listener is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => {
                return Err(Error::Internal(format!("{} listener task: {}", self.desc, e)));
            }
            Err(_) => {
                tracing::warn!(listener = %self.desc, "connections still open after close timeout, aborting");
                task.abort();
            }
        }
        tracing::info!(listener = %self.desc, addr = %self.local_addr, "listener closed");
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
