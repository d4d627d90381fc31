//! Utility functions for fluxnode

use crate::common::{Error, Result};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;

/// Normalize a bind address: `:8086` listens on all interfaces.
pub fn normalize_bind_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Join a hostname and port the way URLs expect (IPv6 literals bracketed).
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// URL other members use to reach this node: the advertised hostname combined
/// with the port the cluster listener actually bound.
pub fn cluster_url(hostname: &str, bound: SocketAddr) -> Result<Url> {
    let raw = format!("http://{}", join_host_port(hostname, bound.port()));
    Url::parse(&raw).map_err(|e| Error::InvalidAddress(format!("{}: {}", raw, e)))
}

/// Parse configured URL strings, preserving order.
pub fn parse_urls(raw: &[String]) -> Result<Vec<Url>> {
    raw.iter()
        .map(|s| {
            Url::parse(s.trim()).map_err(|e| Error::InvalidConfig(format!("invalid URL {}: {}", s, e)))
        })
        .collect()
}

/// Resolve `path` against a base URL (`http://host:8088` + `raft/join`).
pub fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|e| Error::InvalidAddress(format!("{}{}: {}", base, path, e)))
}

/// Read a JSON state file; `None` when it does not exist yet.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON state file via a temp file + rename so readers never see a torn write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
