use super::{Connector, CounterReply, PubSubMessage, Subscriber, Transport};
use crate::config::ClusterEndpoint;
use crate::error::{Result, ThrottlerError};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisResult, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// INCR, then PEXPIRE only if the key carries no TTL yet.
const INCR_EXPIRE_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

fn client_for(endpoint: &ClusterEndpoint) -> Result<Client> {
    let mut info = endpoint.url().as_str().into_connection_info()?;
    info.redis.password = endpoint.credential.clone();
    Ok(Client::open(info)?)
}

pub struct RedisTransport {
    conn: ConnectionManager,
    incr_script: Script,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl RedisTransport {
    /// Records whether the server answered; protocol errors still mean it is up.
    fn track<T>(&self, result: RedisResult<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.ready.store(true, Ordering::SeqCst);
                Ok(value)
            }
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
                    self.ready.store(false, Ordering::SeqCst);
                }
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await;
        self.track(result)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let result = cmd.query_async::<_, ()>(&mut conn).await;
        self.track(result)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await;
        self.track(result).map(|deleted| deleted > 0)
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<CounterReply> {
        let mut conn = self.conn.clone();
        let result = self
            .incr_script
            .key(key)
            .arg(ttl.as_millis() as u64)
            .invoke_async::<_, (i64, i64)>(&mut conn)
            .await;
        let (count, ttl_ms) = self.track(result)?;
        Ok(CounterReply {
            count: count.max(0) as u64,
            ttl_ms: ttl_ms.max(0) as u64,
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<_, i64>(&mut conn)
            .await;
        self.track(result).map(|n| n.max(0) as u64)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let result = redis::cmd("PING").query_async::<_, String>(&mut conn).await;
        self.track(result).map(|_| ())
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.ready.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        // The connection manager closes its socket once the last clone drops.
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Pub/sub side. Each channel-set change opens a fresh subscription
/// connection and retires the previous one.
pub struct RedisSubscriber {
    client: Client,
    sink: mpsc::UnboundedSender<PubSubMessage>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }

        let sink = self.sink.clone();
        let mut stream = Box::pin(pubsub.into_on_message());
        let handle = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(target: "clustered_throttler::transport", error = %e, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                let message = PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if sink.send(message).is_err() {
                    break;
                }
            }
            debug!(target: "clustered_throttler::transport", "subscription stream ended");
        });

        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    async fn close(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, endpoint: &ClusterEndpoint) -> Result<Arc<dyn Transport>> {
        let client = client_for(endpoint)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| ThrottlerError::Transport(format!("connect failed: {}", e)))?;

        Ok(Arc::new(RedisTransport {
            conn,
            incr_script: Script::new(INCR_EXPIRE_SCRIPT),
            ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_subscriber(
        &self,
        endpoint: &ClusterEndpoint,
        sink: mpsc::UnboundedSender<PubSubMessage>,
    ) -> Result<Arc<dyn Subscriber>> {
        Ok(Arc::new(RedisSubscriber {
            client: client_for(endpoint)?,
            sink,
            task: Mutex::new(None),
        }))
    }
}
