//! Metadata-replication client
//!
//! Holds the broker URLs the data node talks to. The list is persisted next to
//! the data so a restarted node can find its brokers without configuration.

use crate::common::{read_json, write_json_atomic, Error, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ClientConfig {
    urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MessagingClient {
    /// URL of the node this client runs on
    url: Url,
    urls: Vec<Url>,
    path: Option<PathBuf>,
}

impl MessagingClient {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            urls: Vec::new(),
            path: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_urls(&mut self, urls: Vec<Url>) {
        self.urls = urls;
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load and persist the broker list at `path`.
    ///
    /// Configured URLs win; the persisted list fills in when none are set.
    /// Ends with `NoBrokerUrls` if no broker can be reached from either source.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.urls.is_empty() {
            if let Some(saved) = read_json::<ClientConfig>(&path)? {
                self.urls = saved
                    .urls
                    .iter()
                    .map(|s| {
                        Url::parse(s).map_err(|e| {
                            Error::Internal(format!("corrupt {}: {}: {}", path.display(), s, e))
                        })
                    })
                    .collect::<Result<_>>()?;
            }
        }

        if self.urls.is_empty() {
            return Err(Error::NoBrokerUrls);
        }

        write_json_atomic(
            &path,
            &ClientConfig {
                urls: self.urls.iter().map(|u| u.to_string()).collect(),
            },
        )?;
        tracing::debug!(path = %path.display(), brokers = self.urls.len(), "messaging client opened");
        self.path = Some(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_open_without_urls_fails() {
        let dir = TempDir::new().unwrap();
        let mut client = MessagingClient::new(url("http://node-a:8088"));
        assert!(matches!(
            client.open(dir.path().join("messaging.json")),
            Err(Error::NoBrokerUrls)
        ));
    }

    #[test]
    fn test_persisted_urls_used_when_unconfigured() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("messaging.json");
        {
            let mut client = MessagingClient::new(url("http://node-a:8088"));
            client.set_urls(vec![url("http://broker-1:8088"), url("http://broker-2:8088")]);
            client.open(&path).unwrap();
        }

        let mut client = MessagingClient::new(url("http://node-a:8088"));
        client.open(&path).unwrap();
        assert_eq!(client.urls().len(), 2);
        assert_eq!(client.urls()[0].host_str(), Some("broker-1"));
    }

    #[test]
    fn test_configured_urls_take_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("messaging.json");
        {
            let mut client = MessagingClient::new(url("http://node-a:8088"));
            client.set_urls(vec![url("http://old:8088")]);
            client.open(&path).unwrap();
        }

        let mut client = MessagingClient::new(url("http://node-a:8088"));
        client.set_urls(vec![url("http://new:8088")]);
        client.open(&path).unwrap();
        assert_eq!(client.urls(), &[url("http://new:8088")]);
    }
}
