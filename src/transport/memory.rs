//! In-process cluster emulation.
//!
//! Keeps the same contract as the networked backend: increments are atomic,
//! TTLs are honoured against the injected [`Clock`], and published messages
//! fan out to every subscriber connection. Faults can be injected to exercise
//! the degraded paths.

use super::{Connector, CounterReply, PubSubMessage, Subscriber, Transport};
use crate::clock::{Clock, SystemClock};
use crate::config::ClusterEndpoint;
use crate::error::{Result, ThrottlerError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<u64>,
}

pub struct MemoryCluster {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    failing_connects: AtomicU32,
    connect_attempts: AtomicU32,
    commands: AtomicU64,
    stalled: AtomicBool,
    bus: broadcast::Sender<PubSubMessage>,
    kill: broadcast::Sender<()>,
}

impl MemoryCluster {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (bus, _) = broadcast::channel(1024);
        let (kill, _) = broadcast::channel(16);
        Arc::new(Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_connects: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            commands: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
            bus,
            kill,
        })
    }

    pub fn with_system_clock() -> Arc<Self> {
        Self::new(Arc::new(SystemClock))
    }

    /// Simulates the cluster going away (or coming back). Going away also
    /// ends every subscription stream.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.drop_subscriptions();
        }
    }

    /// Ends every subscription stream, as a dropped pub/sub connection would.
    pub fn drop_subscriptions(&self) {
        let _ = self.kill.send(());
    }

    /// While stalled, commands never answer.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn stall_if_requested(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// The next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of commands that reached the cluster.
    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    /// Remaining TTL of a live key, if it has one.
    pub fn ttl_ms(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .and_then(|e| e.expires_at)
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    /// Current value of a live key.
    pub fn raw_value(&self, key: &str) -> Option<String> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|e| is_live(e, now))
            .map(|e| e.value.clone())
    }

    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|e| is_live(e, now)).count())
            .unwrap_or(0)
    }

    fn command(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Err(ThrottlerError::Transport("connection refused".to_string()));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ThrottlerError::Internal("memory cluster lock poisoned".to_string()))?;
        let now = self.clock.now_ms();
        entries.retain(|_, e| is_live(e, now));
        Ok(entries)
    }
}

fn is_live(entry: &Entry, now: u64) -> bool {
    entry.expires_at.map_or(true, |at| at > now)
}

pub struct MemoryTransport {
    cluster: Arc<MemoryCluster>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.cluster.stall_if_requested().await;
        let entries = self.cluster.command()?;
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.cluster.stall_if_requested().await;
        let now = self.cluster.clock.now_ms();
        let mut entries = self.cluster.command()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| now + t.as_millis() as u64),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.cluster.stall_if_requested().await;
        let mut entries = self.cluster.command()?;
        Ok(entries.remove(key).is_some())
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<CounterReply> {
        self.cluster.stall_if_requested().await;
        let now = self.cluster.clock.now_ms();
        let mut entries = self.cluster.command()?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });

        let count = entry
            .value
            .parse::<u64>()
            .map_err(|_| ThrottlerError::Transport("value is not an integer".to_string()))?
            + 1;
        entry.value = count.to_string();

        let expires_at = *entry
            .expires_at
            .get_or_insert(now + ttl.as_millis() as u64);

        Ok(CounterReply {
            count,
            ttl_ms: expires_at.saturating_sub(now),
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64> {
        self.cluster.stall_if_requested().await;
        drop(self.cluster.command()?);
        let delivered = self
            .cluster
            .bus
            .send(PubSubMessage {
                channel: channel.to_string(),
                payload: message.to_string(),
            })
            .unwrap_or(0);
        Ok(delivered as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.cluster.stall_if_requested().await;
        drop(self.cluster.command()?);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.cluster.is_available()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MemorySubscriber {
    cluster: Arc<MemoryCluster>,
    sink: mpsc::UnboundedSender<PubSubMessage>,
    channels: Arc<RwLock<HashSet<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySubscriber {
    /// Starts forwarding bus traffic for the current channel set until the
    /// cluster drops subscriptions.
    fn spawn_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.cluster.bus.subscribe();
        let mut kill = self.cluster.kill.subscribe();
        let filter = self.channels.clone();
        let sink = self.sink.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(msg) => {
                            let wanted = filter
                                .read()
                                .map(|set| set.contains(&msg.channel))
                                .unwrap_or(false);
                            if wanted && sink.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = kill.recv() => {
                        debug!(target: "clustered_throttler::transport", "memory subscription dropped");
                        break;
                    }
                }
            }
        })
    }

    fn abort(&self) {
        if let Some(task) = self.task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        if !self.cluster.is_available() {
            return Err(ThrottlerError::Transport("connection refused".to_string()));
        }

        {
            let mut current = self
                .channels
                .write()
                .map_err(|_| ThrottlerError::Internal("subscription lock poisoned".to_string()))?;
            *current = channels.iter().cloned().collect();
        }

        let mut task = self
            .task
            .lock()
            .map_err(|_| ThrottlerError::Internal("subscription lock poisoned".to_string()))?;
        if task.as_ref().map_or(true, |t| t.is_finished()) {
            *task = Some(self.spawn_forwarder());
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().map_or(false, |t| !t.is_finished()))
            .unwrap_or(false)
    }

    async fn close(&self) {
        self.abort();
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.abort();
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
}

impl MemoryConnector {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &ClusterEndpoint) -> Result<Arc<dyn Transport>> {
        self.cluster.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .cluster
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || !self.cluster.is_available() {
            return Err(ThrottlerError::Transport(format!(
                "connection to {}:{} refused",
                endpoint.host, endpoint.port
            )));
        }

        debug!(target: "clustered_throttler::transport", host = %endpoint.host, "memory transport opened");
        Ok(Arc::new(MemoryTransport {
            cluster: self.cluster.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_subscriber(
        &self,
        _endpoint: &ClusterEndpoint,
        sink: mpsc::UnboundedSender<PubSubMessage>,
    ) -> Result<Arc<dyn Subscriber>> {
        if !self.cluster.is_available() {
            return Err(ThrottlerError::Transport("connection refused".to_string()));
        }

        Ok(Arc::new(MemorySubscriber {
            cluster: self.cluster.clone(),
            sink,
            channels: Arc::new(RwLock::new(HashSet::new())),
            task: Mutex::new(None),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryCluster>, MemoryConnector) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cluster = MemoryCluster::new(clock.clone());
        let connector = MemoryConnector::new(cluster.clone());
        (clock, cluster, connector)
    }

    #[tokio::test]
    async fn test_ttl_set_only_on_first_increment() {
        let (clock, cluster, connector) = setup();
        let transport = connector.connect(&ClusterEndpoint::new("mem", 1)).await.unwrap();

        let first = transport.incr_and_expire("k", Duration::from_secs(10)).await.unwrap();
        assert_eq!(first, CounterReply { count: 1, ttl_ms: 10_000 });

        clock.advance(Duration::from_secs(4));
        let second = transport.incr_and_expire("k", Duration::from_secs(10)).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.ttl_ms, 6_000);
        assert_eq!(cluster.ttl_ms("k"), Some(6_000));

        clock.advance(Duration::from_secs(6));
        assert_eq!(transport.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_cluster_refuses_commands() {
        let (_, cluster, connector) = setup();
        let transport = connector.connect(&ClusterEndpoint::new("mem", 1)).await.unwrap();
        cluster.set_available(false);

        assert!(!transport.is_ready());
        assert!(transport.get("k").await.is_err());
        assert!(connector.connect(&ClusterEndpoint::new("mem", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let (_, cluster, connector) = setup();
        cluster.fail_next_connects(2);
        let endpoint = ClusterEndpoint::new("mem", 1);

        assert!(connector.connect(&endpoint).await.is_err());
        assert!(connector.connect(&endpoint).await.is_err());
        assert!(connector.connect(&endpoint).await.is_ok());
        assert_eq!(cluster.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_dropped_subscription_can_be_reopened() {
        let (_, cluster, connector) = setup();
        let endpoint = ClusterEndpoint::new("mem", 1);
        let transport = connector.connect(&endpoint).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = connector.open_subscriber(&endpoint, tx).await.unwrap();
        let channels = ["events".to_string()];

        assert!(!subscriber.is_alive().await);
        subscriber.subscribe(&channels).await.unwrap();
        assert!(subscriber.is_alive().await);

        cluster.drop_subscriptions();
        tokio::time::timeout(Duration::from_secs(1), async {
            while subscriber.is_alive().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        subscriber.subscribe(&channels).await.unwrap();
        transport.publish("events", "again").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, "again");
    }

    #[tokio::test]
    async fn test_subscriber_only_receives_its_channels() {
        let (_, _, connector) = setup();
        let endpoint = ClusterEndpoint::new("mem", 1);
        let transport = connector.connect(&endpoint).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = connector.open_subscriber(&endpoint, tx).await.unwrap();
        subscriber.subscribe(&["wanted".to_string()]).await.unwrap();

        transport.publish("ignored", "a").await.unwrap();
        transport.publish("wanted", "b").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "wanted");
        assert_eq!(msg.payload, "b");
    }
}
