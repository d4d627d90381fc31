//! HTTP surface of a node
//!
//! The cluster router carries membership traffic between nodes
//! (`/raft/join`, `/data_nodes`). Data node registrations are served by the
//! broker, which holds the roster. The API router serves clients; only health
//! and status endpoints live here since query handling is outside this crate.
//! Both are built before the broker and data node exist, so the handles are
//! attached to the shared state as they open.

use crate::broker::{
    CreateDataNodeRequest, DataNodeList, DataNodeRegistry, DataNodeRoster, JoinRequest,
    JoinResponse, LogStatus, RaftLog, FORWARDED_HEADER,
};
use crate::common::{Error, ErrorBody};
use crate::data::{DataLayer, DataNode};
use crate::BuildInfo;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use reqwest::Url;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Membership requests are tiny; anything larger is not ours.
const MAX_BODY_BYTES: usize = 64 * 1024;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.to_http_status(), Json(ErrorBody::from_error(&self))).into_response()
    }
}

#[derive(Default)]
struct Attached {
    cluster_url: Option<Url>,
    raft_log: Option<Arc<RaftLog>>,
    registry: Option<Arc<DataNodeRegistry>>,
    data_node: Option<Arc<DataNode>>,
}

/// Handles shared by the cluster, API, and admin routers.
#[derive(Clone)]
pub struct NodeState {
    hostname: String,
    build: BuildInfo,
    started_at: chrono::DateTime<chrono::Utc>,
    attached: Arc<RwLock<Attached>>,
}

#[derive(Debug, Serialize)]
pub struct DataStatus {
    pub id: u64,
    pub nodes: BTreeMap<u64, String>,
    pub lines_written: u64,
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub hostname: String,
    pub version: String,
    pub commit: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub cluster_url: Option<String>,
    pub broker: Option<LogStatus>,
    pub data: Option<DataStatus>,
}

impl NodeState {
    pub fn new(hostname: impl Into<String>, build: BuildInfo) -> Self {
        Self {
            hostname: hostname.into(),
            build,
            started_at: chrono::Utc::now(),
            attached: Arc::new(RwLock::new(Attached::default())),
        }
    }

    pub async fn set_cluster_url(&self, url: Url) {
        self.attached.write().await.cluster_url = Some(url);
    }

    pub async fn attach_raft_log(&self, log: Arc<RaftLog>) {
        self.attached.write().await.raft_log = Some(log);
    }

    pub async fn attach_registry(&self, registry: Arc<DataNodeRegistry>) {
        self.attached.write().await.registry = Some(registry);
    }

    pub async fn attach_data_node(&self, node: Arc<DataNode>) {
        self.attached.write().await.data_node = Some(node);
    }

    /// Drop every handle so closed subsystems stop receiving requests.
    pub async fn detach_all(&self) {
        let mut attached = self.attached.write().await;
        attached.raft_log = None;
        attached.registry = None;
        attached.data_node = None;
    }

    pub async fn status(&self) -> NodeStatus {
        let attached = self.attached.read().await;
        NodeStatus {
            hostname: self.hostname.clone(),
            version: self.build.version.clone(),
            commit: self.build.commit.clone(),
            started_at: self.started_at,
            cluster_url: attached.cluster_url.as_ref().map(|u| u.to_string()),
            broker: attached.raft_log.as_ref().map(|log| log.status()),
            data: attached.data_node.as_ref().map(|node| DataStatus {
                id: node.id(),
                nodes: node.nodes(),
                lines_written: node.lines_written(),
            }),
        }
    }

    async fn raft_log(&self) -> Result<Arc<RaftLog>, Error> {
        self.attached
            .read()
            .await
            .raft_log
            .clone()
            .ok_or_else(|| Error::NotInitialized("broker is not running on this node".into()))
    }

    async fn registry(&self) -> Result<Arc<DataNodeRegistry>, Error> {
        self.attached
            .read()
            .await
            .registry
            .clone()
            .ok_or_else(|| Error::NotInitialized("broker is not running on this node".into()))
    }
}

/// Router for the cluster listener.
pub fn cluster_router(state: NodeState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/raft/join", axum::routing::post(raft_join))
        .route("/raft/status", get(raft_status))
        .route("/data_nodes", get(list_data_nodes).post(create_data_node))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the API listener.
pub fn api_router(state: NodeState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn status(State(state): State<NodeState>) -> Json<NodeStatus> {
    Json(state.status().await)
}

fn parse_peer(raw: &str) -> Result<Url, Error> {
    Url::parse(raw).map_err(|e| Error::InvalidAddress(format!("{}: {}", raw, e)))
}

async fn raft_join(
    State(state): State<NodeState>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, Error> {
    let peer = parse_peer(&req.url)?;
    let log = state.raft_log().await?;
    Ok(Json(log.handle_join(&peer)?))
}

async fn raft_status(State(state): State<NodeState>) -> Result<Json<LogStatus>, Error> {
    Ok(Json(state.raft_log().await?.status()))
}

async fn create_data_node(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Json(req): Json<CreateDataNodeRequest>,
) -> Result<Json<DataNodeRoster>, Error> {
    let forwarded = headers.contains_key(FORWARDED_HEADER);
    let registry = state.registry().await?;
    Ok(Json(registry.create(&req, forwarded).await?))
}

async fn list_data_nodes(State(state): State<NodeState>) -> Result<Json<DataNodeList>, Error> {
    Ok(Json(state.registry().await?.list()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, RaftOptions, ReplicatedLog};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state() -> NodeState {
        NodeState::new("node-a", BuildInfo::default())
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn join_request(path: &str, url: &str) -> Request<Body> {
        Request::post(path)
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"url":"{}"}}"#, url)))
            .unwrap()
    }

    fn register_request(url: &str, initialize: bool) -> Request<Body> {
        Request::post("/data_nodes")
            .header("content-type", "application/json")
            .body(Body::from(format!(
                r#"{{"url":"{}","initialize":{}}}"#,
                url, initialize
            )))
            .unwrap()
    }

    /// Broker state with an opened, not yet initialized, raft log.
    async fn broker_state(dir: &TempDir) -> (NodeState, Arc<RaftLog>) {
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
        let registry =
            Arc::new(DataNodeRegistry::new(broker, log.clone(), Duration::from_secs(1)).unwrap());

        let state = state();
        state.attach_raft_log(log.clone()).await;
        state.attach_registry(registry).await;
        (state, log)
    }

    #[tokio::test]
    async fn test_raft_join_without_broker_is_unavailable() {
        let resp = cluster_router(state())
            .oneshot(join_request("/raft/join", "http://node-b:8088"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["code"], "not_initialized");
    }

    #[tokio::test]
    async fn test_raft_join_adds_member() {
        let dir = TempDir::new().unwrap();
        let (state, log) = broker_state(&dir).await;
        log.initialize().await.unwrap();

        let resp = cluster_router(state.clone())
            .oneshot(join_request("/raft/join", "http://node-b:8088"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["id"], 2);
        assert_eq!(body["leader"], "http://node-a:8088/");

        let bad = cluster_router(state)
            .oneshot(join_request("/raft/join", "not a url"))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_data_node_registration_on_broker() {
        let dir = TempDir::new().unwrap();
        let (state, log) = broker_state(&dir).await;
        log.initialize().await.unwrap();
        let router = cluster_router(state);

        let resp = router
            .clone()
            .oneshot(register_request("http://node-a:8088", false))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "data_node_not_found");

        let resp = router
            .clone()
            .oneshot(register_request("http://node-a:8088", true))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], 1);

        let resp = router
            .clone()
            .oneshot(register_request("http://node-b:8088", false))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], 2);

        let resp = router
            .clone()
            .oneshot(register_request("http://node-c:8088", true))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["code"], "already_initialized");

        let resp = router
            .oneshot(Request::get("/data_nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["leader"], "http://node-a:8088/");
        assert_eq!(body["nodes"]["2"], "http://node-b:8088/");
    }

    #[tokio::test]
    async fn test_registration_without_leader_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let (state, _log) = broker_state(&dir).await;

        let resp = cluster_router(state)
            .oneshot(register_request("http://node-b:8088", false))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["code"], "not_leader");
    }

    #[tokio::test]
    async fn test_data_nodes_without_broker_is_unavailable() {
        let resp = cluster_router(state())
            .oneshot(register_request("http://node-b:8088", false))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["code"], "not_initialized");
    }

    #[tokio::test]
    async fn test_status_reports_roles() {
        let state = state();
        state
            .set_cluster_url(Url::parse("http://node-a:8088").unwrap())
            .await;
        let resp = api_router(state)
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["hostname"], "node-a");
        assert_eq!(body["cluster_url"], "http://node-a:8088/");
        assert!(body["broker"].is_null());
    }
}
