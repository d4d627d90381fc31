//! Administrative HTTP server

use crate::common::Result;
use crate::node::http::NodeState;
use crate::node::listener::{FatalSender, Listener};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;

pub struct AdminServer {
    addr: String,
    state: NodeState,
    listener: Option<Listener>,
}

impl AdminServer {
    pub fn new(addr: impl Into<String>, state: NodeState) -> Self {
        Self {
            addr: addr.into(),
            state,
            listener: None,
        }
    }

    pub async fn listen_and_serve(&mut self, fatal: FatalSender) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let router = Router::new()
            .route("/", get(index))
            .route("/status", get(status))
            .with_state(self.state.clone());
        self.listener = Some(Listener::open("admin", &self.addr, router, fatal).await?);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(listener) = self.listener.as_mut() {
            listener.close().await?;
        }
        self.listener = None;
        Ok(())
    }
}

async fn index(State(state): State<NodeState>) -> impl IntoResponse {
    let status = state.status().await;
    format!(
        "fluxnode {} ({})\nhost: {}\ncluster: {}\n",
        status.version,
        status.commit,
        status.hostname,
        status.cluster_url.as_deref().unwrap_or("-"),
    )
}

async fn status(State(state): State<NodeState>) -> impl IntoResponse {
    Json(state.status().await)
}
