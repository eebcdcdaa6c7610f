//! Point-bucket limiters for realtime traffic.
//!
//! Each (policy, identity) pair owns two cluster keys: a points counter that
//! expires `duration` after its first consume, and a block marker holding the
//! epoch millisecond the block ends. Setting a block clears the counter, so
//! the identity starts from a full budget once the block ends, even when the
//! block is shorter than the window. Both are driven by the same atomic
//! primitives as the HTTP store, so every process sees the same budget.

use crate::clock::Clock;
use crate::connection::{ClusterConnectionManager, ClusterReply};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventPolicy {
    ConnectionAttempt,
    MessageSend,
    RoomJoinLeave,
    Typing,
}

impl EventPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            EventPolicy::ConnectionAttempt => "connection-attempt",
            EventPolicy::MessageSend => "message-send",
            EventPolicy::RoomJoinLeave => "room-join-leave",
            EventPolicy::Typing => "typing",
        }
    }

    /// Policy guarding a named client event, if any.
    pub fn for_event(event: &str) -> Option<Self> {
        match event {
            "send_message" => Some(EventPolicy::MessageSend),
            "join_room" | "leave_room" => Some(EventPolicy::RoomJoinLeave),
            "typing_start" | "typing_stop" => Some(EventPolicy::Typing),
            _ => None,
        }
    }

    pub fn settings(&self) -> BucketSettings {
        let minute = Duration::from_secs(60);
        match self {
            EventPolicy::ConnectionAttempt => BucketSettings::new(10, minute, Duration::from_secs(300)),
            EventPolicy::MessageSend => BucketSettings::new(60, minute, minute),
            EventPolicy::RoomJoinLeave => BucketSettings::new(100, minute, minute),
            EventPolicy::Typing => BucketSettings::new(30, minute, Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSettings {
    pub points: u64,
    pub duration: Duration,
    pub block_duration: Duration,
}

impl BucketSettings {
    pub fn new(points: u64, duration: Duration, block_duration: Duration) -> Self {
        Self {
            points,
            duration,
            block_duration,
        }
    }
}

/// Snapshot of one bucket after a consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    pub points_remaining: u64,
    pub refill_at: u64,
    pub blocked_until: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Allowed(BucketState),
    Rejected { retry_after: u64, state: BucketState },
}

impl ConsumeOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ConsumeOutcome::Allowed(_))
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ConsumeOutcome::Rejected { retry_after, .. } => Some(*retry_after),
            ConsumeOutcome::Allowed(_) => None,
        }
    }
}

/// User id when known, else the connection address.
pub fn resolve_identity(user_id: Option<&str>, address: &str) -> String {
    match user_id {
        Some(user) if !user.is_empty() => user.to_string(),
        _ => address.to_string(),
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

pub struct EventRateLimiterRegistry {
    cluster: Arc<ClusterConnectionManager>,
    clock: Arc<dyn Clock>,
    prefix: String,
    enabled: bool,
}

impl EventRateLimiterRegistry {
    pub fn new(cluster: Arc<ClusterConnectionManager>, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            cluster,
            clock,
            prefix: prefix.into(),
            enabled: true,
        }
    }

    pub fn disabled(cluster: Arc<ClusterConnectionManager>, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(cluster, clock, prefix)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn points_key(&self, policy: EventPolicy, identity: &str) -> String {
        format!("{}event:{}:{}", self.prefix, policy.name(), identity)
    }

    fn block_key(&self, policy: EventPolicy, identity: &str) -> String {
        format!("{}event:{}:block:{}", self.prefix, policy.name(), identity)
    }

    fn open_bucket(&self, settings: &BucketSettings, now: u64) -> BucketState {
        BucketState {
            points_remaining: settings.points,
            refill_at: now + settings.duration.as_millis() as u64,
            blocked_until: None,
        }
    }

    /// Takes one point from `identity`'s bucket for `policy`.
    pub async fn consume(&self, policy: EventPolicy, identity: &str) -> ConsumeOutcome {
        let settings = policy.settings();
        let now = self.clock.now_ms();

        if !self.enabled {
            return ConsumeOutcome::Allowed(self.open_bucket(&settings, now));
        }

        let block_key = self.block_key(policy, identity);
        match self.cluster.safe_get(&block_key).await {
            ClusterReply::Value(Some(raw)) => {
                if let Some(until) = raw.parse::<u64>().ok().filter(|until| *until > now) {
                    debug!(
                        target: "clustered_throttler::event_limiter",
                        policy = policy.name(),
                        identity,
                        "Identity is blocked"
                    );
                    return ConsumeOutcome::Rejected {
                        retry_after: ceil_secs(until - now).max(1),
                        state: BucketState {
                            points_remaining: 0,
                            refill_at: until,
                            blocked_until: Some(until),
                        },
                    };
                }
            }
            ClusterReply::Value(None) => {}
            ClusterReply::Unavailable => return self.fail_open(policy, &settings, now),
        }

        let points_key = self.points_key(policy, identity);
        let reply = match self
            .cluster
            .safe_increment_and_expire(&points_key, settings.duration)
            .await
        {
            ClusterReply::Value(reply) => reply,
            ClusterReply::Unavailable => return self.fail_open(policy, &settings, now),
        };

        let refill_at = now + reply.ttl_ms;
        if reply.count <= settings.points {
            return ConsumeOutcome::Allowed(BucketState {
                points_remaining: settings.points - reply.count,
                refill_at,
                blocked_until: None,
            });
        }

        if settings.block_duration.is_zero() {
            return ConsumeOutcome::Rejected {
                retry_after: ceil_secs(reply.ttl_ms).max(1),
                state: BucketState {
                    points_remaining: 0,
                    refill_at,
                    blocked_until: None,
                },
            };
        }

        let block_ms = settings.block_duration.as_millis() as u64;
        let until = now + block_ms;
        if self
            .cluster
            .safe_set(&block_key, &until.to_string(), Some(settings.block_duration))
            .await
            .is_unavailable()
        {
            warn!(
                target: "clustered_throttler::event_limiter",
                policy = policy.name(),
                identity,
                "Could not persist block marker"
            );
        }
        // The block replaces the spent window: a fresh budget starts when it ends.
        let _ = self.cluster.safe_del(&points_key).await;
        info!(
            target: "clustered_throttler::event_limiter",
            policy = policy.name(),
            identity,
            block_ms,
            "Event budget exhausted, blocking"
        );

        ConsumeOutcome::Rejected {
            retry_after: ceil_secs(block_ms).max(1),
            state: BucketState {
                points_remaining: 0,
                refill_at,
                blocked_until: Some(until),
            },
        }
    }

    fn fail_open(&self, policy: EventPolicy, settings: &BucketSettings, now: u64) -> ConsumeOutcome {
        warn!(
            target: "clustered_throttler::event_limiter",
            policy = policy.name(),
            "Cluster unavailable, allowing event"
        );
        ConsumeOutcome::Allowed(self.open_bucket(settings, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ClusterEndpoint;
    use crate::connection::ManagerSettings;
    use crate::transport::{MemoryCluster, MemoryConnector};

    async fn registry() -> (Arc<ManualClock>, Arc<MemoryCluster>, EventRateLimiterRegistry) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let cluster = MemoryCluster::new(clock.clone());
        let mut settings = ManagerSettings::default();
        settings.quiescence = Duration::ZERO;
        let manager = ClusterConnectionManager::new(
            ClusterEndpoint::new("memory", 6379),
            settings,
            Arc::new(MemoryConnector::new(cluster.clone())),
        );
        manager.connect().await.unwrap();
        let registry = EventRateLimiterRegistry::new(manager, clock.clone(), "rl:");
        (clock, cluster, registry)
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(EventPolicy::for_event("send_message"), Some(EventPolicy::MessageSend));
        assert_eq!(EventPolicy::for_event("leave_room"), Some(EventPolicy::RoomJoinLeave));
        assert_eq!(EventPolicy::for_event("typing_stop"), Some(EventPolicy::Typing));
        assert_eq!(EventPolicy::for_event("ping"), None);
    }

    #[test]
    fn test_resolve_identity() {
        assert_eq!(resolve_identity(Some("u1"), "10.0.0.1:4000"), "u1");
        assert_eq!(resolve_identity(None, "10.0.0.1:4000"), "10.0.0.1:4000");
    }

    #[tokio::test]
    async fn test_message_send_blocks_after_budget() {
        let (clock, _, registry) = registry().await;

        for n in 1..=60u64 {
            match registry.consume(EventPolicy::MessageSend, "u1").await {
                ConsumeOutcome::Allowed(state) => assert_eq!(state.points_remaining, 60 - n),
                other => panic!("consume {} rejected: {:?}", n, other),
            }
        }

        let outcome = registry.consume(EventPolicy::MessageSend, "u1").await;
        assert_eq!(outcome.retry_after(), Some(60));

        clock.advance(Duration::from_secs(59));
        let outcome = registry.consume(EventPolicy::MessageSend, "u1").await;
        assert_eq!(outcome.retry_after(), Some(1));

        clock.advance(Duration::from_secs(1));
        assert!(registry.consume(EventPolicy::MessageSend, "u1").await.is_allowed());
    }

    #[tokio::test]
    async fn test_block_outlasts_refill() {
        let (clock, _, registry) = registry().await;

        for _ in 0..30 {
            assert!(registry.consume(EventPolicy::Typing, "u2").await.is_allowed());
        }
        clock.advance(Duration::from_secs(50));
        assert_eq!(registry.consume(EventPolicy::Typing, "u2").await.retry_after(), Some(30));

        // Points refill at 60s but the block runs until 80s.
        clock.advance(Duration::from_secs(15));
        let outcome = registry.consume(EventPolicy::Typing, "u2").await;
        assert_eq!(outcome.retry_after(), Some(15));

        clock.advance(Duration::from_secs(15));
        assert!(registry.consume(EventPolicy::Typing, "u2").await.is_allowed());
    }

    #[tokio::test]
    async fn test_short_block_ends_with_full_budget() {
        let (clock, _, registry) = registry().await;

        for _ in 0..30 {
            assert!(registry.consume(EventPolicy::Typing, "u3").await.is_allowed());
        }
        assert_eq!(registry.consume(EventPolicy::Typing, "u3").await.retry_after(), Some(30));

        // Block is 30s, the window 60s: the block alone decides.
        clock.advance(Duration::from_secs(30));
        match registry.consume(EventPolicy::Typing, "u3").await {
            ConsumeOutcome::Allowed(state) => assert_eq!(state.points_remaining, 29),
            other => panic!("expected a fresh budget, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_consumes_do_not_spend_points() {
        let (clock, cluster, registry) = registry().await;
        for _ in 0..11 {
            registry.consume(EventPolicy::ConnectionAttempt, "10.0.0.9").await;
        }
        let points_key = "rl:event:connection-attempt:10.0.0.9";

        clock.advance(Duration::from_secs(10));
        for _ in 0..5 {
            assert_eq!(
                registry.consume(EventPolicy::ConnectionAttempt, "10.0.0.9").await.retry_after(),
                Some(290)
            );
        }
        assert_eq!(cluster.raw_value(points_key), None);
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let (_, _, registry) = registry().await;
        for _ in 0..61 {
            registry.consume(EventPolicy::MessageSend, "noisy").await;
        }
        assert!(!registry.consume(EventPolicy::MessageSend, "noisy").await.is_allowed());
        assert!(registry.consume(EventPolicy::MessageSend, "quiet").await.is_allowed());
        assert!(registry.consume(EventPolicy::Typing, "noisy").await.is_allowed());
    }

    #[tokio::test]
    async fn test_fails_open_when_cluster_unavailable() {
        let (_, cluster, registry) = registry().await;
        cluster.set_available(false);
        for _ in 0..500 {
            assert!(registry.consume(EventPolicy::MessageSend, "u1").await.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_disabled_registry_allows() {
        let (clock, _, enabled) = registry().await;
        let registry = EventRateLimiterRegistry::disabled(enabled.cluster.clone(), clock, "rl:");
        for _ in 0..100 {
            assert!(registry.consume(EventPolicy::ConnectionAttempt, "x").await.is_allowed());
        }
    }
}
