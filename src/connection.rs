//! Lifecycle and failure-tolerant access to the shared cluster.
//!
//! One [`ClusterConnectionManager`] is built at startup and handed to every
//! consumer behind an `Arc`. It owns the primary command connection and, once
//! somebody subscribes, a second connection reserved for pub/sub traffic.
//!
//! Only the startup [`connect`](ClusterConnectionManager::connect) can fail
//! loudly. After that every operation goes through a `safe_*` wrapper that
//! returns [`ClusterReply::Unavailable`] instead of an error, and runtime
//! failures are absorbed into the `Degraded` state.

use crate::config::{ClusterEndpoint, Config};
use crate::error::{Result, ThrottlerError};
use crate::transport::{Connector, CounterReply, PubSubMessage, Subscriber, Transport};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CANARY_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Degraded,
}

/// Lifecycle signals that drive [`ConnectionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Ready,
    Error(String),
    Closed,
}

/// Result of a safe wrapper. `Unavailable` covers a connection that is not
/// ready, a transport error and a timeout alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterReply<T> {
    Value(T),
    Unavailable,
}

impl<T> ClusterReply<T> {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ClusterReply::Unavailable)
    }

    pub fn value(self) -> Option<T> {
        match self {
            ClusterReply::Value(v) => Some(v),
            ClusterReply::Unavailable => None,
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        self.value().unwrap_or(default)
    }
}

/// Outcome of a successful startup connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReport {
    pub attempts: u32,
    /// Backoff slept after each failed attempt, in order.
    pub backoff_delays: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub quiescence: Duration,
    pub health_check_interval: Duration,
    pub self_test: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: config.reconnect_base_delay(),
            quiescence: config.quiescence(),
            health_check_interval: config.health_check_interval(),
            self_test: config.self_test,
        }
    }
}

pub type MessageHandler = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

type HandlerSlot = Arc<RwLock<Option<(u64, MessageHandler)>>>;

/// Returned by [`ClusterConnectionManager::safe_subscribe`].
pub struct HandlerRegistration {
    id: u64,
    slot: Weak<RwLock<Option<(u64, MessageHandler)>>>,
}

impl HandlerRegistration {
    /// Removes the handler unless a later subscription already replaced it.
    pub fn unregister(self) -> bool {
        let Some(slot) = self.slot.upgrade() else {
            return false;
        };
        let Ok(mut current) = slot.write() else {
            return false;
        };
        match current.as_ref() {
            Some((id, _)) if *id == self.id => {
                *current = None;
                true
            }
            _ => false,
        }
    }
}

pub struct ClusterConnectionManager {
    endpoint: ClusterEndpoint,
    settings: ManagerSettings,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    subscriber: tokio::sync::Mutex<Option<Arc<dyn Subscriber>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    handler: HandlerSlot,
    handler_ids: AtomicU64,
    /// Channels of the last successful subscribe, reissued after recovery.
    channels: Mutex<Vec<String>>,
}

impl ClusterConnectionManager {
    pub fn new(
        endpoint: ClusterEndpoint,
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            endpoint,
            settings,
            connector,
            state,
            transport: RwLock::new(None),
            subscriber: tokio::sync::Mutex::new(None),
            dispatcher: Mutex::new(None),
            supervisor: Mutex::new(None),
            handler: Arc::new(RwLock::new(None)),
            handler_ids: AtomicU64::new(0),
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn from_config(config: &Config, connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::new(config.endpoint.clone(), ManagerSettings::from(config), connector)
    }

    pub fn endpoint(&self) -> &ClusterEndpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions. Dropping the receiver unregisters it.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connects with a bounded retry loop. Any previous connection is torn
    /// down first, so calling this again is safe.
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectReport> {
        self.teardown_primary().await;
        tokio::time::sleep(self.settings.quiescence).await;

        let max_attempts = self.settings.max_reconnect_attempts.max(1);
        let mut backoff_delays = Vec::new();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            self.handle_event(TransportEvent::Connecting);
            info!(
                target: "clustered_throttler::connection",
                host = %self.endpoint.host,
                port = self.endpoint.port,
                tls = self.endpoint.tls,
                attempt,
                max_attempts,
                "Connecting to cluster"
            );

            match self.attempt_connect().await {
                Ok(()) => {
                    self.handle_event(TransportEvent::Ready);
                    self.start_supervisor();
                    info!(target: "clustered_throttler::connection", attempt, "Cluster connection ready");
                    return Ok(ConnectReport {
                        attempts: attempt,
                        backoff_delays,
                    });
                }
                Err(e) => {
                    warn!(target: "clustered_throttler::connection", attempt, error = %e, "Cluster connect attempt failed");
                    last_error = e.to_string();
                    self.teardown_primary().await;
                    self.handle_event(TransportEvent::Error(last_error.clone()));
                }
            }

            if attempt < max_attempts {
                let delay = self.settings.reconnect_base_delay * attempt;
                backoff_delays.push(delay);
                debug!(target: "clustered_throttler::connection", ?delay, "Backing off before next attempt");
                tokio::time::sleep(delay).await;
            }
        }

        self.handle_event(TransportEvent::Closed);
        error!(
            target: "clustered_throttler::connection",
            attempts = max_attempts,
            error = %last_error,
            "Giving up on cluster connection"
        );
        Err(ThrottlerError::ExhaustedReconnect {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt_connect(&self) -> Result<()> {
        let transport = match tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.endpoint),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ThrottlerError::TransportTimeout(self.settings.connect_timeout)),
        };

        self.install_transport(Some(transport));
        self.handle_event(TransportEvent::Connected);

        if self.settings.self_test {
            self.self_test().await?;
        }
        Ok(())
    }

    /// Writes a canary key and reads it back over the primary connection.
    pub async fn self_test(&self) -> Result<()> {
        let transport = self.current_transport().ok_or(ThrottlerError::TransportUnavailable)?;
        let token = uuid::Uuid::new_v4().to_string();
        let key = format!("cluster:canary:{}", token);

        self.timed(transport.set(&key, &token, Some(CANARY_TTL))).await?;
        let read_back = self.timed(transport.get(&key)).await?;
        let _ = self.timed(transport.del(&key)).await;

        if read_back.as_deref() != Some(token.as_str()) {
            return Err(ThrottlerError::Transport(
                "canary read back a different value".to_string(),
            ));
        }
        debug!(target: "clustered_throttler::connection", "Cluster self-test passed");
        Ok(())
    }

    /// Closes both connections. Safe to call when nothing is open.
    pub async fn disconnect(&self) {
        self.teardown_primary().await;

        if let Some(subscriber) = self.subscriber.lock().await.take() {
            subscriber.close().await;
        }
        if let Some(task) = self.dispatcher.lock().ok().and_then(|mut d| d.take()) {
            task.abort();
        }
        if let Ok(mut handler) = self.handler.write() {
            *handler = None;
        }
        if let Ok(mut channels) = self.channels.lock() {
            channels.clear();
        }

        self.handle_event(TransportEvent::Closed);
        info!(target: "clustered_throttler::connection", "Cluster connections closed");
    }

    async fn teardown_primary(&self) {
        if let Some(task) = self.supervisor.lock().ok().and_then(|mut s| s.take()) {
            task.abort();
        }
        if let Some(transport) = self.install_transport(None) {
            transport.close().await;
        }
    }

    /// Ready state and a transport that agrees.
    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Ready
            && self.current_transport().map_or(false, |t| t.is_ready())
    }

    /// Applies a lifecycle event. The only place the state changes.
    pub fn handle_event(&self, event: TransportEvent) {
        let previous = self.state();
        let next = match (&event, previous) {
            (TransportEvent::Connecting, _) => ConnectionState::Connecting,
            (TransportEvent::Connected, _) => ConnectionState::Connected,
            (TransportEvent::Ready, _) => ConnectionState::Ready,
            (TransportEvent::Error(_), ConnectionState::Disconnected) => ConnectionState::Disconnected,
            (TransportEvent::Error(_), _) => ConnectionState::Degraded,
            (TransportEvent::Closed, _) => ConnectionState::Disconnected,
        };

        if next != previous {
            match (&event, next) {
                (TransportEvent::Error(reason), ConnectionState::Degraded) => warn!(
                    target: "clustered_throttler::connection",
                    from = ?previous,
                    reason = %reason,
                    "Cluster connection degraded"
                ),
                _ => debug!(
                    target: "clustered_throttler::connection",
                    from = ?previous,
                    to = ?next,
                    "Cluster connection state changed"
                ),
            }
        }
        self.state.send_replace(next);
    }

    pub async fn safe_get(&self, key: &str) -> ClusterReply<Option<String>> {
        self.guarded("get", |t| async move { t.get(key).await }).await
    }

    pub async fn safe_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ClusterReply<()> {
        self.guarded("set", |t| async move { t.set(key, value, ttl).await })
            .await
    }

    pub async fn safe_del(&self, key: &str) -> ClusterReply<bool> {
        self.guarded("del", |t| async move { t.del(key).await }).await
    }

    pub async fn safe_increment_and_expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> ClusterReply<CounterReply> {
        self.guarded("incr", |t| async move { t.incr_and_expire(key, ttl).await })
            .await
    }

    pub async fn safe_publish(&self, channel: &str, message: &str) -> ClusterReply<u64> {
        self.guarded("publish", |t| async move { t.publish(channel, message).await })
            .await
    }

    /// Round-trip latency of a PING.
    pub async fn safe_ping(&self) -> ClusterReply<Duration> {
        let started = Instant::now();
        match self.guarded("ping", |t| async move { t.ping().await }).await {
            ClusterReply::Value(()) => ClusterReply::Value(started.elapsed()),
            ClusterReply::Unavailable => ClusterReply::Unavailable,
        }
    }

    /// Lazily opens the dedicated pub/sub connection.
    pub async fn ensure_subscriber(&self) -> Result<Arc<dyn Subscriber>> {
        let mut slot = self.subscriber.lock().await;
        if let Some(subscriber) = slot.as_ref() {
            return Ok(subscriber.clone());
        }

        let (sink, mut messages) = mpsc::unbounded_channel::<PubSubMessage>();
        let subscriber = match tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.open_subscriber(&self.endpoint, sink),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ThrottlerError::TransportTimeout(self.settings.connect_timeout)),
        };

        let handler = self.handler.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let current = handler
                    .read()
                    .ok()
                    .and_then(|h| h.as_ref().map(|(_, f)| f.clone()));
                if let Some(on_message) = current {
                    on_message(message);
                }
            }
        });
        if let Some(previous) = self.dispatcher.lock().ok().and_then(|mut d| d.replace(dispatcher)) {
            previous.abort();
        }

        info!(target: "clustered_throttler::connection", "Subscriber connection opened");
        *slot = Some(subscriber.clone());
        Ok(subscriber)
    }

    /// Subscribes to exactly `channels`, replacing any previous handler.
    pub async fn safe_subscribe(
        &self,
        channels: &[String],
        on_message: MessageHandler,
    ) -> ClusterReply<HandlerRegistration> {
        if !self.is_healthy() {
            debug!(target: "clustered_throttler::connection", "Cluster unavailable, skipping subscribe");
            return ClusterReply::Unavailable;
        }

        let subscriber = match self.ensure_subscriber().await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                warn!(target: "clustered_throttler::connection", error = %e, "Could not open subscriber connection");
                return ClusterReply::Unavailable;
            }
        };

        let id = self.handler_ids.fetch_add(1, Ordering::SeqCst) + 1;
        match self.handler.write() {
            Ok(mut current) => {
                if current.is_some() {
                    debug!(target: "clustered_throttler::connection", "Replacing previous message handler");
                }
                *current = Some((id, on_message));
            }
            Err(_) => return ClusterReply::Unavailable,
        }

        if let Err(e) = self.timed(subscriber.subscribe(channels)).await {
            warn!(target: "clustered_throttler::connection", error = %e, ?channels, "Subscribe failed");
            return ClusterReply::Unavailable;
        }

        if let Ok(mut current) = self.channels.lock() {
            *current = channels.to_vec();
        }
        debug!(target: "clustered_throttler::connection", ?channels, "Subscribed");
        ClusterReply::Value(HandlerRegistration {
            id,
            slot: Arc::downgrade(&self.handler),
        })
    }

    async fn guarded<T, F, Fut>(&self, op: &'static str, call: F) -> ClusterReply<T>
    where
        F: FnOnce(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let transport = match self.current_transport() {
            Some(t) if self.is_healthy() => t,
            _ => {
                debug!(target: "clustered_throttler::connection", op, "Cluster unavailable, short-circuiting");
                return ClusterReply::Unavailable;
            }
        };

        match self.timed(call(transport.clone())).await {
            Ok(value) => ClusterReply::Value(value),
            Err(e) => {
                warn!(target: "clustered_throttler::connection", op, error = %e, "Cluster command failed");
                if e.is_transport()
                    && (matches!(e, ThrottlerError::TransportTimeout(_)) || !transport.is_ready())
                {
                    self.handle_event(TransportEvent::Error(e.to_string()));
                }
                ClusterReply::Unavailable
            }
        }
    }

    async fn timed<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.settings.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ThrottlerError::TransportTimeout(self.settings.command_timeout)),
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().ok().and_then(|t| t.clone())
    }

    fn install_transport(&self, transport: Option<Arc<dyn Transport>>) -> Option<Arc<dyn Transport>> {
        match self.transport.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, transport),
            Err(_) => None,
        }
    }

    fn start_supervisor(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let interval = self.settings.health_check_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.supervise().await;
            }
        });
        if let Some(previous) = self.supervisor.lock().ok().and_then(|mut s| s.replace(task)) {
            previous.abort();
        }
    }

    /// One supervision tick: notice silent failures, recover from Degraded
    /// and reopen a subscription whose stream ended.
    async fn supervise(&self) {
        let Some(transport) = self.current_transport() else {
            return;
        };

        match self.state() {
            ConnectionState::Ready if !transport.is_ready() => {
                self.handle_event(TransportEvent::Error("transport reports not ready".to_string()));
            }
            ConnectionState::Ready => {
                if !self.subscription_alive().await {
                    self.restore_subscription().await;
                }
            }
            ConnectionState::Degraded => {
                if self.timed(transport.ping()).await.is_ok() && transport.is_ready() {
                    info!(target: "clustered_throttler::connection", "Cluster connection recovered");
                    self.handle_event(TransportEvent::Ready);
                    self.restore_subscription().await;
                }
            }
            _ => {}
        }
    }

    /// True when nothing was subscribed or the stream is still flowing.
    async fn subscription_alive(&self) -> bool {
        if self.remembered_channels().is_empty() {
            return true;
        }
        let subscriber = self.subscriber.lock().await.clone();
        match subscriber {
            Some(subscriber) => subscriber.is_alive().await,
            None => false,
        }
    }

    fn remembered_channels(&self) -> Vec<String> {
        self.channels.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Reissues the last subscribe. The installed handler is left in place.
    async fn restore_subscription(&self) {
        let channels = self.remembered_channels();
        if channels.is_empty() {
            return;
        }

        let subscriber = match self.ensure_subscriber().await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                warn!(target: "clustered_throttler::connection", error = %e, "Could not reopen subscriber connection");
                return;
            }
        };
        match self.timed(subscriber.subscribe(&channels)).await {
            Ok(()) => info!(target: "clustered_throttler::connection", ?channels, "Subscription restored"),
            Err(e) => warn!(target: "clustered_throttler::connection", error = %e, ?channels, "Resubscribe failed"),
        }
    }
}
