//! Realtime hooks: handshake gating, per-event limits and cross-process relay.

use crate::connection::{ClusterConnectionManager, ClusterReply, MessageHandler};
use crate::error::ThrottlerError;
use crate::event_limiter::{resolve_identity, ConsumeOutcome, EventPolicy, EventRateLimiterRegistry};
use crate::key_generator::{client_address, AuthenticatedUser};
use crate::response::RejectionBody;
use crate::transport::PubSubMessage;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Cluster channel carrying accepted events between processes.
pub const EVENTS_CHANNEL: &str = "realtime:events";

/// Event emitted to a connection whose event was rejected without an ack.
pub const RATE_LIMITED_EVENT: &str = "rate_limited";

pub type AckCallback = Box<dyn FnOnce(Value) + Send>;

/// Outbound side of one realtime connection.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

pub enum EventVerdict {
    /// Let the event through; the ack, if any, is handed back to the caller.
    Proceed(Option<AckCallback>),
    Rejected,
}

impl EventPolicy {
    fn rejection_message(&self) -> &'static str {
        match self {
            EventPolicy::ConnectionAttempt => "Too many connection attempts, please try again later.",
            EventPolicy::MessageSend => "You are sending messages too quickly.",
            EventPolicy::RoomJoinLeave => "Too many room changes, please slow down.",
            EventPolicy::Typing => "Too many typing events.",
        }
    }
}

pub struct RealtimeGate {
    limiter: Arc<EventRateLimiterRegistry>,
}

impl RealtimeGate {
    pub fn new(limiter: Arc<EventRateLimiterRegistry>) -> Self {
        Self { limiter }
    }

    /// Must run before a session is accepted.
    pub async fn on_handshake(&self, identity: &str) -> Result<(), RejectionBody> {
        let policy = EventPolicy::ConnectionAttempt;
        match self.limiter.consume(policy, identity).await {
            ConsumeOutcome::Allowed(_) => Ok(()),
            ConsumeOutcome::Rejected { retry_after, .. } => {
                info!(target: "clustered_throttler::realtime", identity, retry_after, "Handshake rejected");
                Err(RejectionBody::new(policy.rejection_message(), retry_after))
            }
        }
    }

    /// Rejections answer through `ack` when present, otherwise through a
    /// [`RATE_LIMITED_EVENT`] on the same connection. The session stays open.
    pub async fn on_event(
        &self,
        identity: &str,
        event: &str,
        ack: Option<AckCallback>,
        emitter: &dyn EventEmitter,
    ) -> EventVerdict {
        let Some(policy) = EventPolicy::for_event(event) else {
            return EventVerdict::Proceed(ack);
        };

        let retry_after = match self.limiter.consume(policy, identity).await {
            ConsumeOutcome::Allowed(_) => return EventVerdict::Proceed(ack),
            ConsumeOutcome::Rejected { retry_after, .. } => retry_after,
        };

        debug!(target: "clustered_throttler::realtime", identity, event, retry_after, "Event rejected");
        let body = RejectionBody::new(policy.rejection_message(), retry_after);
        match ack {
            Some(ack) => ack(json!(body)),
            None => emitter.emit(
                RATE_LIMITED_EVENT,
                json!({ "event": event, "error": body.error, "retryAfter": body.retry_after }),
            ),
        }
        EventVerdict::Rejected
    }
}

/// An accepted event as relayed through the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedEvent {
    pub from: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "ackId")]
    ack_id: Option<u64>,
}

pub struct RealtimeHub {
    gate: RealtimeGate,
    cluster: Arc<ClusterConnectionManager>,
    local: broadcast::Sender<String>,
    trust_proxy: bool,
}

impl RealtimeHub {
    pub fn new(gate: RealtimeGate, cluster: Arc<ClusterConnectionManager>) -> Arc<Self> {
        Self::with_proxy_trust(gate, cluster, true)
    }

    /// `trust_proxy` decides whether handshake identities may come from
    /// `x-forwarded-for` / `x-real-ip`.
    pub fn with_proxy_trust(
        gate: RealtimeGate,
        cluster: Arc<ClusterConnectionManager>,
        trust_proxy: bool,
    ) -> Arc<Self> {
        let (local, _) = broadcast::channel(256);
        Arc::new(Self {
            gate,
            cluster,
            local,
            trust_proxy,
        })
    }

    pub fn gate(&self) -> &RealtimeGate {
        &self.gate
    }

    /// Receives every event relayed to this process.
    pub fn subscribe_local(&self) -> broadcast::Receiver<String> {
        self.local.subscribe()
    }

    /// Forwards cluster traffic on [`EVENTS_CHANNEL`] to local sessions.
    pub async fn attach_cluster(&self) -> bool {
        let local = self.local.clone();
        let handler: MessageHandler = Arc::new(move |message: PubSubMessage| {
            let _ = local.send(message.payload);
        });

        match self
            .cluster
            .safe_subscribe(&[EVENTS_CHANNEL.to_string()], handler)
            .await
        {
            ClusterReply::Value(_) => {
                info!(target: "clustered_throttler::realtime", channel = EVENTS_CHANNEL, "Relaying realtime events through the cluster");
                true
            }
            ClusterReply::Unavailable => {
                warn!(target: "clustered_throttler::realtime", "Cluster relay unavailable, events stay on this process");
                false
            }
        }
    }

    /// Publishes through the cluster, or delivers locally if it cannot.
    pub async fn relay(&self, event: &RelayedEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "clustered_throttler::realtime", error = %e, "Could not encode relayed event");
                return;
            }
        };

        if self.cluster.safe_publish(EVENTS_CHANNEL, &payload).await.is_unavailable() {
            let _ = self.local.send(payload);
        }
    }
}

struct SessionEmitter {
    tx: mpsc::UnboundedSender<Message>,
}

impl EventEmitter for SessionEmitter {
    fn emit(&self, event: &str, payload: Value) {
        let frame = json!({ "event": event, "payload": payload });
        let _ = self.tx.send(Message::Text(frame.to_string()));
    }
}

/// `GET /ws`. The connection-attempt budget is spent before upgrading.
pub async fn ws_handler(
    State(hub): State<Arc<RealtimeHub>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    user: Option<Extension<AuthenticatedUser>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let address = client_address(
        &headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        hub.trust_proxy,
    );
    let identity = resolve_identity(user.as_ref().map(|Extension(u)| u.0.as_str()), &address);

    if let Err(rejection) = hub.gate().on_handshake(&identity).await {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", rejection.retry_after.to_string())],
            Json(rejection),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| run_session(socket, identity, hub))
}

async fn run_session(socket: WebSocket, identity: String, hub: Arc<RealtimeHub>) {
    let session = uuid::Uuid::new_v4();
    info!(target: "clustered_throttler::realtime", %session, identity = %identity, "Session opened");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let mut relayed = hub.subscribe_local();

    let writer = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                Some(message) = out_rx.recv() => message,
                received = relayed.recv() => match received {
                    Ok(text) => Message::Text(text),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                else => break,
            };
            if sink.send(outgoing).await.is_err() {
                break;
            }
        }
    });

    let emitter = SessionEmitter { tx: out_tx.clone() };
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let error = ThrottlerError::Validation(format!("malformed frame: {}", e));
                emitter.emit("error", json!({ "error": error.to_string() }));
                continue;
            }
        };

        let ack: Option<AckCallback> = frame.ack_id.map(|id| {
            let tx = out_tx.clone();
            Box::new(move |response: Value| {
                let reply = json!({ "ackId": id, "response": response });
                let _ = tx.send(Message::Text(reply.to_string()));
            }) as AckCallback
        });

        match hub.gate().on_event(&identity, &frame.event, ack, &emitter).await {
            EventVerdict::Rejected => continue,
            EventVerdict::Proceed(ack) => {
                hub.relay(&RelayedEvent {
                    from: identity.clone(),
                    event: frame.event,
                    payload: frame.payload,
                })
                .await;
                if let Some(ack) = ack {
                    ack(json!({ "ok": true }));
                }
            }
        }
    }

    writer.abort();
    info!(target: "clustered_throttler::realtime", %session, identity = %identity, "Session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ClusterEndpoint;
    use crate::connection::ManagerSettings;
    use crate::transport::{MemoryCluster, MemoryConnector};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingEmitter {
        emitted: Mutex<Vec<(String, Value)>>,
    }

    impl EventEmitter for RecordingEmitter {
        fn emit(&self, event: &str, payload: Value) {
            self.emitted.lock().unwrap().push((event.to_string(), payload));
        }
    }

    async fn hub() -> (Arc<MemoryCluster>, Arc<RealtimeHub>) {
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
        let limiter = Arc::new(EventRateLimiterRegistry::new(manager.clone(), clock, "rl:"));
        (cluster, RealtimeHub::new(RealtimeGate::new(limiter), manager))
    }

    #[tokio::test]
    async fn test_handshake_rejected_after_ten_attempts() {
        let (_, hub) = hub().await;
        for _ in 0..10 {
            assert!(hub.gate().on_handshake("10.0.0.1").await.is_ok());
        }
        let rejection = hub.gate().on_handshake("10.0.0.1").await.unwrap_err();
        assert_eq!(rejection.retry_after, 300);
        assert!(hub.gate().on_handshake("10.0.0.2").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejection_goes_to_ack_when_present() {
        let (_, hub) = hub().await;
        let emitter = RecordingEmitter::default();
        for _ in 0..30 {
            hub.gate().on_event("u1", "typing_start", None, &emitter).await;
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let ack: AckCallback = Box::new(move |v| tx.send(v).unwrap());
        let verdict = hub.gate().on_event("u1", "typing_stop", Some(ack), &emitter).await;

        assert!(matches!(verdict, EventVerdict::Rejected));
        assert_eq!(rx.recv().unwrap()["retryAfter"], 30);
        assert!(emitter.emitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_emits_event_without_ack() {
        let (_, hub) = hub().await;
        let emitter = RecordingEmitter::default();
        for _ in 0..60 {
            assert!(matches!(
                hub.gate().on_event("u1", "send_message", None, &emitter).await,
                EventVerdict::Proceed(None)
            ));
        }
        let verdict = hub.gate().on_event("u1", "send_message", None, &emitter).await;
        assert!(matches!(verdict, EventVerdict::Rejected));

        let emitted = emitter.emitted.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, RATE_LIMITED_EVENT);
        assert_eq!(emitted[0].1["event"], "send_message");
        assert_eq!(emitted[0].1["retryAfter"], 60);
    }

    #[tokio::test]
    async fn test_unlimited_events_pass_with_ack() {
        let (_, hub) = hub().await;
        let emitter = RecordingEmitter::default();
        let ack: AckCallback = Box::new(|_| {});
        for _ in 0..500 {
            assert!(matches!(
                hub.gate().on_event("u1", "heartbeat", None, &emitter).await,
                EventVerdict::Proceed(None)
            ));
        }
        assert!(matches!(
            hub.gate().on_event("u1", "heartbeat", Some(ack), &emitter).await,
            EventVerdict::Proceed(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_through_cluster() {
        let (_, hub) = hub().await;
        assert!(hub.attach_cluster().await);
        let mut local = hub.subscribe_local();

        let event = RelayedEvent {
            from: "u1".to_string(),
            event: "send_message".to_string(),
            payload: json!({"room": "general", "text": "hi"}),
        };
        hub.relay(&event).await;

        let received: RelayedEvent = serde_json::from_str(&local.recv().await.unwrap()).unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_relay_falls_back_to_local_delivery() {
        let (cluster, hub) = hub().await;
        let mut local = hub.subscribe_local();
        cluster.set_available(false);

        let event = RelayedEvent {
            from: "u1".to_string(),
            event: "join_room".to_string(),
            payload: Value::Null,
        };
        hub.relay(&event).await;

        let received: RelayedEvent = serde_json::from_str(&local.recv().await.unwrap()).unwrap();
        assert_eq!(received.event, "join_room");
    }
}
