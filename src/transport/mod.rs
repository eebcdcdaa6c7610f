//! Cluster transport seam.
//!
//! The connection manager never talks to a backend directly; it goes through
//! the [`Connector`], [`Transport`] and [`Subscriber`] traits so the same
//! lifecycle and fail-open logic drives a real cluster and the in-process
//! emulation used for local development and tests.

pub mod memory;
pub mod redis_backend;

use crate::config::ClusterEndpoint;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use memory::{MemoryCluster, MemoryConnector};
pub use redis_backend::RedisConnector;

/// Reply of an atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReply {
    pub count: u64,
    /// Remaining time to live of the counter in milliseconds.
    pub ttl_ms: u64,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Command connection to the cluster.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically increments `key`. The TTL is applied only when the key has
    /// none yet, so a bucket expires `ttl` after its first increment.
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<CounterReply>;

    /// Returns the number of receivers the cluster delivered the message to.
    async fn publish(&self, channel: &str, message: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;

    /// Whether the transport itself believes it can serve commands.
    fn is_ready(&self) -> bool;

    async fn close(&self);
}

/// Dedicated publish/subscribe connection.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Replaces the current channel set with `channels`.
    async fn subscribe(&self, channels: &[String]) -> Result<()>;

    /// False once the message stream has ended, e.g. after the connection
    /// dropped. Calling `subscribe` again reopens it.
    async fn is_alive(&self) -> bool;

    async fn close(&self);
}

/// Opens connections for an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &ClusterEndpoint) -> Result<Arc<dyn Transport>>;

    /// Messages for subscribed channels are pushed into `sink`.
    async fn open_subscriber(
        &self,
        endpoint: &ClusterEndpoint,
        sink: mpsc::UnboundedSender<PubSubMessage>,
    ) -> Result<Arc<dyn Subscriber>>;
}
