//! Error types for fluxnode

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // === Listener Errors ===
    #[error("{desc} listener failed to bind {addr}: {source}")]
    Bind {
        desc: String,
        addr: String,
        source: std::io::Error,
    },

    #[error("{desc} server failed to serve on {addr}: {source}")]
    Serve {
        desc: String,
        addr: String,
        source: std::io::Error,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // === Membership Errors ===
    #[error("Already initialized")]
    AlreadyInitialized,

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("No data nodes found")]
    DataNodeNotFound,

    #[error("Not the raft leader (leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("{layer} initialization failed: {source}")]
    Initialize {
        layer: &'static str,
        source: Box<Error>,
    },

    #[error("{layer} join failed: no candidate accepted ({attempts} attempted)")]
    JoinExhausted { layer: &'static str, attempts: usize },

    #[error("Messaging client has no broker URLs")]
    NoBrokerUrls,

    #[error("Failed to open {what} at {path}: {source}")]
    Open {
        what: &'static str,
        path: String,
        source: Box<Error>,
    },

    #[error("Failed to close {component}: {source}")]
    Close {
        component: String,
        source: Box<Error>,
    },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Join loops advance to the next candidate on any error, but only these
    /// indicate the same candidate could succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_)
                | Error::Http(_)
                | Error::NotInitialized(_)
                | Error::NotLeader { .. }
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::DataNodeNotFound => StatusCode::NOT_FOUND,
            Error::NotInitialized(_) | Error::NotLeader { .. } | Error::Closed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::AlreadyInitialized => StatusCode::CONFLICT,
            Error::InvalidConfig(_) | Error::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code carried in cluster error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DataNodeNotFound => "data_node_not_found",
            Error::NotInitialized(_) => "not_initialized",
            Error::NotLeader { .. } => "not_leader",
            Error::Closed(_) => "closed",
            Error::AlreadyInitialized => "already_initialized",
            Error::InvalidConfig(_) | Error::InvalidAddress(_) => "bad_request",
            _ => "internal",
        }
    }

    pub(crate) fn close(component: impl Into<String>, source: Error) -> Self {
        Error::Close {
            component: component.into(),
            source: Box::new(source),
        }
    }
}

/// JSON body of a failed cluster request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

impl ErrorBody {
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            error: err.to_string(),
        }
    }

    /// Decode the body of a non-success response; bodies that are not ours
    /// keep the raw text under code `unknown`.
    pub async fn from_response(resp: reqwest::Response) -> (reqwest::StatusCode, Self) {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(ErrorBody {
            code: "unknown".to_string(),
            error: text,
        });
        (status, body)
    }

    /// Rebuild the error a peer reported. Membership signals keep their
    /// variant so a forwarded request fails the same way a local one would.
    pub fn into_error(self, status: reqwest::StatusCode, url: &reqwest::Url) -> Error {
        match self.code.as_str() {
            "data_node_not_found" => Error::DataNodeNotFound,
            "already_initialized" => Error::AlreadyInitialized,
            _ => Error::Http(format!("{} from {}: {}", status, url, self.error)),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::ConnectionFailed(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}
