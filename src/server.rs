use crate::clock::Clock;
use crate::config::{Backend, Config};
use crate::connection::ClusterConnectionManager;
use crate::error::{Result, ThrottlerError};
use crate::event_limiter::EventRateLimiterRegistry;
use crate::handlers::{accepted, health_check, list_policies, readiness_check, AppState};
use crate::health::HealthChecker;
use crate::middleware::{enforce_policy, logging_middleware, PolicyGuard};
use crate::rate_limiter::{HttpPolicy, RateLimiterRegistry};
use crate::realtime::{ws_handler, RealtimeGate, RealtimeHub};
use crate::store::RateLimitStore;
use crate::transport::{Connector, MemoryCluster, MemoryConnector, RedisConnector};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Picks the transport for the configured backend.
pub fn connector_for(config: &Config, clock: Arc<dyn Clock>) -> Arc<dyn Connector> {
    match config.backend {
        Backend::Redis => Arc::new(RedisConnector),
        Backend::Memory => Arc::new(MemoryConnector::new(MemoryCluster::new(clock))),
    }
}

/// Connects to the cluster and wires the limiters on top of it.
///
/// A failed startup connect does not abort: the limiters come up disabled and
/// the process keeps serving.
pub async fn build_state(config: &Config, connector: Arc<dyn Connector>, clock: Arc<dyn Clock>) -> AppState {
    let cluster = ClusterConnectionManager::from_config(config, connector);

    let connected = match cluster.connect().await {
        Ok(report) => {
            info!(
                attempts = report.attempts,
                backoff = ?report.backoff_delays,
                "Cluster connected"
            );
            true
        }
        Err(e) => {
            error!(
                error = %e,
                feature = "http rate limiting, realtime rate limiting",
                "Cluster unavailable at startup, dependent features disabled"
            );
            false
        }
    };

    assemble(config, cluster, clock, connected).await
}

/// State for a process whose cluster settings were rejected. No connection
/// is attempted and both limiters let everything through.
pub async fn build_detached_state(config: &Config, clock: Arc<dyn Clock>) -> AppState {
    let connector = Arc::new(MemoryConnector::new(MemoryCluster::new(clock.clone())));
    let cluster = ClusterConnectionManager::from_config(config, connector);
    warn!(feature = "http rate limiting, realtime rate limiting", "Running without a cluster");
    assemble(config, cluster, clock, false).await
}

async fn assemble(
    config: &Config,
    cluster: Arc<ClusterConnectionManager>,
    clock: Arc<dyn Clock>,
    enabled: bool,
) -> AppState {
    let store = RateLimitStore::new(cluster.clone(), clock.clone(), config.key_prefix.clone());
    let (registry, limiter) = if enabled {
        (
            RateLimiterRegistry::new(store, &config.overrides),
            EventRateLimiterRegistry::new(cluster.clone(), clock, config.key_prefix.clone()),
        )
    } else {
        (
            RateLimiterRegistry::disabled(store, &config.overrides),
            EventRateLimiterRegistry::disabled(cluster.clone(), clock, config.key_prefix.clone()),
        )
    };

    let hub = RealtimeHub::with_proxy_trust(
        RealtimeGate::new(Arc::new(limiter)),
        cluster.clone(),
        config.trust_proxy,
    );
    if enabled {
        hub.attach_cluster().await;
    }

    AppState {
        health: Arc::new(HealthChecker::new(cluster.clone())),
        registry: Arc::new(registry),
        hub,
        cluster,
        trust_proxy: config.trust_proxy,
    }
}

/// Builds the router. Each route group sits behind its own policy and the
/// whole app behind the global one.
pub fn create_app(state: AppState) -> Router {
    let registry = state.registry.clone();
    let trust_proxy = state.trust_proxy;
    let guard = move |policy: HttpPolicy| {
        middleware::from_fn_with_state(
            PolicyGuard::new(registry.clone(), policy).trust_proxy(trust_proxy),
            enforce_policy,
        )
    };

    let api = Router::new()
        .route("/status", get(accepted))
        .route("/items", get(accepted).post(accepted))
        .route_layer(guard(HttpPolicy::Api));
    let auth = Router::new()
        .route("/login", post(accepted))
        .route("/register", post(accepted))
        .route_layer(guard(HttpPolicy::Auth));
    let upload = Router::new()
        .route("/files", post(accepted))
        .route_layer(guard(HttpPolicy::Upload));
    let chat = Router::new()
        .route("/messages", get(accepted).post(accepted))
        .route_layer(guard(HttpPolicy::Chat));
    let webhooks = Router::new()
        .route("/:provider", post(accepted))
        .route_layer(guard(HttpPolicy::Webhook));

    let realtime = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.hub.clone());

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/rate-limits", get(list_policies))
        .nest("/api", api)
        .nest("/auth", auth)
        .nest("/upload", upload)
        .nest("/chat", chat)
        .nest("/webhooks", webhooks)
        .with_state(state)
        .merge(realtime)
        .layer(guard(HttpPolicy::Global))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    cluster: Arc<ClusterConnectionManager>,
}

impl Server {
    pub fn new(bind_addr: SocketAddr, state: AppState) -> Self {
        let cluster = state.cluster.clone();
        Self {
            app: create_app(state),
            bind_addr,
            cluster,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| ThrottlerError::Internal(format!("failed to bind {}: {}", self.bind_addr, e)))?;

        info!("Throttler server listening on {}", self.bind_addr);
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ThrottlerError::Internal(format!("server error: {}", e)))?;

        self.cluster.disconnect().await;
        info!("Cluster connections closed");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
