//! Replicated-log join protocol
//!
//! Brings a freshly opened log participant into a well-defined membership
//! state: keep existing state, join through the first seed that accepts us,
//! or found a new cluster when no seeds are known. The decision is taken once
//! from the persisted index and never re-evaluated.

use crate::broker::raft_log::{LogJoinReply, ReplicatedLog};
use crate::common::{Error, Result};
use reqwest::Url;
use std::time::Duration;
use tokio::time::Instant;

const LAYER: &str = "raft log";

/// How the log came to be a cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMembership {
    /// Persisted state was found; seeds were ignored.
    Existing { index: u64, term: u64 },
    /// A seed accepted the join.
    Joined { via: Url },
    /// The join raced with an initialize of the local log.
    AlreadyInitialized { via: Url },
    /// No seeds: this node founded the cluster.
    Founded,
}

/// Join or initialize `log` using `seeds` in priority order.
///
/// Seed exhaustion and a failed self-initialize are fatal for bootstrap and
/// returned as errors; individual seed failures only advance to the next seed.
pub async fn join_or_initialize_log<L>(log: &L, seeds: &[Url]) -> Result<LogMembership>
where
    L: ReplicatedLog + ?Sized,
{
    let (index, term) = log.last_index_term();
    if index != 0 {
        tracing::info!(
            index,
            term,
            ignored_seeds = seeds.len(),
            "broker already member of cluster, using existing state and ignoring join URLs"
        );
        return Ok(LogMembership::Existing { index, term });
    }

    if !seeds.is_empty() {
        return join_log(log, seeds).await;
    }

    log.initialize().await.map_err(|e| Error::Initialize {
        layer: LAYER,
        source: Box::new(e),
    })?;
    tracing::info!(url = %log.url(), "initialized broker as founding member");
    Ok(LogMembership::Founded)
}

async fn join_log<L>(log: &L, seeds: &[Url]) -> Result<LogMembership>
where
    L: ReplicatedLog + ?Sized,
{
    let candidates = dedup_in_order(seeds);
    for seed in &candidates {
        match log.join(seed).await {
            Ok(LogJoinReply::Joined) => {
                tracing::info!(seed = %seed, "join: connected raft log");
                return Ok(LogMembership::Joined { via: seed.clone() });
            }
            Ok(LogJoinReply::AlreadyInitialized) => {
                tracing::info!(seed = %seed, "join: raft log already initialized");
                return Ok(LogMembership::AlreadyInitialized { via: seed.clone() });
            }
            Err(e) => {
                tracing::warn!(
                    seed = %seed,
                    error = %e,
                    retryable = e.is_retryable(),
                    "join: failed to connect to raft cluster"
                );
            }
        }
    }

    tracing::error!(attempts = candidates.len(), "join: failed to connect raft log to any seed");
    Err(Error::JoinExhausted {
        layer: LAYER,
        attempts: candidates.len(),
    })
}

/// Drop repeated candidates so no candidate is tried twice.
pub(crate) fn dedup_in_order(urls: &[Url]) -> Vec<Url> {
    let mut seen = Vec::with_capacity(urls.len());
    for url in urls {
        if !seen.contains(url) {
            seen.push(url.clone());
        }
    }
    seen
}

/// Proof that the log layer had its chance to elect a leader.
///
/// The data-layer join protocol takes this as an argument, so it cannot run
/// before [`await_log_ready`] has completed.
#[derive(Debug, Clone)]
pub struct LogReady {
    leader: Option<Url>,
    waited: Duration,
}

impl LogReady {
    /// Leader known when the wait ended; `None` when the grace period expired.
    pub fn leader(&self) -> Option<&Url> {
        self.leader.as_ref()
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Wait for the log to report a leader, bounded by `grace`.
///
/// Without a local log (data-only node) this is a plain wait of `grace`,
/// giving remote brokers time to elect a leader after a full-cluster restart.
/// An expired grace period is not an error: startup proceeds and the data
/// layer join surfaces any real unavailability.
pub async fn await_log_ready(
    log: Option<&dyn ReplicatedLog>,
    grace: Duration,
    poll: Duration,
) -> LogReady {
    let start = Instant::now();

    let Some(log) = log else {
        tokio::time::sleep(grace).await;
        return LogReady {
            leader: None,
            waited: start.elapsed(),
        };
    };

    loop {
        if let Some(leader) = log.leader() {
            tracing::debug!(leader = %leader, waited_ms = start.elapsed().as_millis() as u64, "raft leader known");
            return LogReady {
                leader: Some(leader),
                waited: start.elapsed(),
            };
        }
        let elapsed = start.elapsed();
        if elapsed >= grace {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                state = %log.state(),
                "no raft leader after election grace period, continuing startup"
            );
            return LogReady {
                leader: None,
                waited: elapsed,
            };
        }
        tokio::time::sleep(poll.min(grace - elapsed)).await;
    }
}
