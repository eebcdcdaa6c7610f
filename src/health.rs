use crate::connection::{ClusterConnectionManager, ClusterReply, ConnectionState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub cluster: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub state: String,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

/// Reports process health. The process is never "unhealthy" because of the
/// cluster: without it the limiters fail open and the status is `degraded`.
pub struct HealthChecker {
    cluster: Arc<ClusterConnectionManager>,
    started: Instant,
}

impl HealthChecker {
    pub fn new(cluster: Arc<ClusterConnectionManager>) -> Self {
        Self {
            cluster,
            started: Instant::now(),
        }
    }

    pub fn cluster_ready(&self) -> bool {
        self.cluster.is_healthy()
    }

    pub async fn check_health(&self) -> HealthStatus {
        let cluster = self.check_cluster().await;
        let overall = if cluster.status == "healthy" {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            dependencies: DependencyStatus { cluster },
        }
    }

    async fn check_cluster(&self) -> ServiceStatus {
        let state = self.cluster.state();
        let state_name = serde_json::to_value(state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        match self.cluster.safe_ping().await {
            ClusterReply::Value(latency) => ServiceStatus {
                status: "healthy".to_string(),
                state: state_name,
                response_time_ms: Some(latency.as_millis() as u64),
                error: None,
            },
            ClusterReply::Unavailable => ServiceStatus {
                status: "unavailable".to_string(),
                state: state_name,
                response_time_ms: None,
                error: Some(match state {
                    ConnectionState::Disconnected => "cluster not connected".to_string(),
                    _ => "cluster not ready".to_string(),
                }),
            },
        }
    }
}
