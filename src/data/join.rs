//! Data-layer join protocol
//!
//! Keyed on the assigned data node id rather than a log index. Requires a
//! [`LogReady`] token: the brokers must have had their election grace period
//! before the data layer contacts them.

use crate::broker::join::dedup_in_order;
use crate::broker::LogReady;
use crate::common::{Error, Result};
use crate::data::server::{DataJoinReply, DataLayer};
use reqwest::Url;

const LAYER: &str = "data node";

/// How the data node came to be a cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMembership {
    /// An identity was already assigned; join URLs were ignored.
    Existing { id: u64 },
    /// A peer registered us.
    Joined { id: u64, via: Url },
    /// This node initialized itself as the first data node.
    Founded { id: u64 },
}

/// Join or initialize `node`, reachable at `self_url`, using `join_urls` in
/// priority order.
pub async fn join_or_initialize_data<D>(
    ready: &LogReady,
    node: &D,
    self_url: &Url,
    join_urls: &[Url],
) -> Result<DataMembership>
where
    D: DataLayer + ?Sized,
{
    let id = node.id();
    if id != 0 {
        tracing::info!(
            id,
            ignored_urls = join_urls.len(),
            "data node already member of cluster, using existing state and ignoring join URLs"
        );
        return Ok(DataMembership::Existing { id });
    }

    tracing::debug!(
        leader = ?ready.leader().map(|u| u.as_str()),
        waited_ms = ready.waited().as_millis() as u64,
        "data layer joining after election grace"
    );

    if join_urls.is_empty() {
        return initialize(node, self_url).await;
    }

    let candidates = dedup_in_order(join_urls);
    for peer in &candidates {
        match node.join(self_url, peer).await {
            Ok(DataJoinReply::Joined { id }) => {
                tracing::info!(id, peer = %peer, url = %self_url, "join: connected data node");
                return Ok(DataMembership::Joined {
                    id,
                    via: peer.clone(),
                });
            }
            Ok(DataJoinReply::NoDataNodes) => {
                tracing::info!(peer = %peer, "join: no data nodes found, initializing as first data node");
                return initialize(node, self_url).await;
            }
            Err(e) => {
                tracing::warn!(
                    peer = %peer,
                    url = %self_url,
                    error = %e,
                    retryable = e.is_retryable(),
                    "join: failed to connect data node"
                );
            }
        }
    }

    tracing::error!(attempts = candidates.len(), "join: failed to connect data node to any peer");
    Err(Error::JoinExhausted {
        layer: LAYER,
        attempts: candidates.len(),
    })
}

async fn initialize<D>(node: &D, self_url: &Url) -> Result<DataMembership>
where
    D: DataLayer + ?Sized,
{
    node.initialize(self_url)
        .await
        .map_err(|e| Error::Initialize {
            layer: LAYER,
            source: Box::new(e),
        })?;
    let id = node.id();
    tracing::info!(id, url = %self_url, "initialized data node");
    Ok(DataMembership::Founded { id })
}
