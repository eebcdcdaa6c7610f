//! Fixed-window counters kept in the cluster.

use crate::clock::Clock;
use crate::connection::{ClusterConnectionManager, ClusterReply};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// State of one counter after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementResult {
    pub total_hits: u64,
    pub remaining: u64,
    /// End of the current window, in milliseconds since the epoch.
    pub reset_time: u64,
    /// False when the cluster could not be asked and the request was let through.
    pub counted: bool,
}

#[derive(Clone)]
pub struct RateLimitStore {
    cluster: Arc<ClusterConnectionManager>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl RateLimitStore {
    pub fn new(cluster: Arc<ClusterConnectionManager>, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            cluster,
            clock,
            prefix: prefix.into(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Counts one hit against `key` in the current window.
    ///
    /// The window is `floor(now / window)`, so every process agrees on the
    /// bucket without coordination. The cluster increments atomically; this
    /// never reads a counter and writes it back. If the cluster cannot be
    /// reached the hit is reported as the first of its window.
    pub async fn increment(&self, key: &str, window: Duration, max: u64) -> IncrementResult {
        let window_ms = (window.as_millis() as u64).max(1);
        let now = self.clock.now_ms();
        let bucket = now / window_ms;
        let reset_time = (bucket + 1) * window_ms;
        let counter_key = format!("{}{}:{}", self.prefix, key, bucket);

        match self
            .cluster
            .safe_increment_and_expire(&counter_key, Duration::from_millis(window_ms))
            .await
        {
            ClusterReply::Value(reply) => IncrementResult {
                total_hits: reply.count,
                remaining: max.saturating_sub(reply.count),
                reset_time,
                counted: true,
            },
            ClusterReply::Unavailable => {
                warn!(
                    target: "clustered_throttler::store",
                    key = %counter_key,
                    "Cluster unavailable, allowing request"
                );
                IncrementResult {
                    total_hits: 1,
                    remaining: max.saturating_sub(1),
                    reset_time,
                    counted: false,
                }
            }
        }
    }

    /// Drops the counter for `key` in the current window.
    pub async fn reset_key(&self, key: &str, window: Duration) -> bool {
        let window_ms = (window.as_millis() as u64).max(1);
        let bucket = self.clock.now_ms() / window_ms;
        let counter_key = format!("{}{}:{}", self.prefix, key, bucket);
        self.cluster.safe_del(&counter_key).await.unwrap_or(false)
    }
}
