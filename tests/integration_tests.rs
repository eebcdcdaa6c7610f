use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use clustered_throttler::clock::{Clock, ManualClock};
use clustered_throttler::config::{Config, PolicyOverride};
use clustered_throttler::handlers::AppState;
use clustered_throttler::server::{build_detached_state, build_state, create_app};
use clustered_throttler::transport::{MemoryCluster, MemoryConnector};
use clustered_throttler::ConnectionState;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        quiescence_ms: 0,
        reconnect_base_delay_ms: 1,
        max_reconnect_attempts: 2,
        health_check_interval_ms: 50,
        ..Config::default()
    }
}

async fn setup_with(config: Config) -> (Arc<MemoryCluster>, Arc<ManualClock>, AppState) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cluster = MemoryCluster::new(clock.clone());
    let connector = Arc::new(MemoryConnector::new(cluster.clone()));
    let state = build_state(&config, connector, clock.clone() as Arc<dyn Clock>).await;
    (cluster, clock, state)
}

async fn setup() -> (Arc<MemoryCluster>, Arc<ManualClock>, Router) {
    let (cluster, clock, state) = setup_with(test_config()).await;
    (cluster, clock, create_app(state))
}

fn request(method: &str, uri: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_, _, app) = setup().await;

    let response = app.oneshot(request("GET", "/health", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["dependencies"]["cluster"]["state"], "ready");
}

#[tokio::test]
async fn test_health_checks_are_never_counted() {
    let (cluster, _, app) = setup().await;
    let before = cluster.key_count();

    for _ in 0..20 {
        let response = app
            .clone()
            .oneshot(request("GET", "/ready", "10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("ratelimit-limit").is_none());
    }

    assert_eq!(cluster.key_count(), before);
}

#[tokio::test]
async fn test_auth_policy_rejects_eleventh_attempt() {
    let (_, _, app) = setup().await;

    for i in 1..=10u64 {
        let response = app
            .clone()
            .oneshot(request("POST", "/auth/login", "10.0.0.3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "attempt {}", i);
        assert_eq!(response.headers()["ratelimit-limit"], "10");
        assert_eq!(
            response.headers()["ratelimit-remaining"],
            (10 - i).to_string().as_str()
        );
    }

    let response = app
        .clone()
        .oneshot(request("POST", "/auth/login", "10.0.0.3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1 && retry_after <= 900);

    let json = body_json(response).await;
    assert_eq!(json["error"], "Too many authentication attempts, please try again later.");
    assert_eq!(json["retryAfter"], retry_after);

    // Another client is unaffected.
    let response = app
        .oneshot(request("POST", "/auth/login", "10.0.0.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_window_rollover_clears_rejection() {
    let (_, clock, app) = setup().await;

    for _ in 0..11 {
        app.clone()
            .oneshot(request("POST", "/auth/register", "10.0.0.5"))
            .await
            .unwrap();
    }
    let response = app
        .clone()
        .oneshot(request("POST", "/auth/register", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    clock.advance(std::time::Duration::from_secs(15 * 60));
    let response = app
        .oneshot(request("POST", "/auth/register", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_fail_open_when_cluster_goes_away() {
    let (cluster, _, app) = setup().await;
    cluster.set_available(false);

    for _ in 0..15 {
        let response = app
            .clone()
            .oneshot(request("POST", "/auth/login", "10.0.0.6"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.oneshot(request("GET", "/ready", "10.0.0.6")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["status"], "not_ready");
}

#[tokio::test]
async fn test_startup_failure_disables_limiting() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cluster = MemoryCluster::new(clock.clone());
    cluster.set_available(false);
    let connector = Arc::new(MemoryConnector::new(cluster.clone()));

    let state = build_state(&test_config(), connector, clock as Arc<dyn Clock>).await;
    assert_eq!(state.cluster.state(), ConnectionState::Disconnected);
    assert!(!state.registry.is_enabled());
    assert_eq!(cluster.connect_attempts(), 2);

    let app = create_app(state);
    for _ in 0..12 {
        let response = app
            .clone()
            .oneshot(request("POST", "/auth/login", "10.0.0.7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn test_detached_state_serves_without_cluster() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
    let state = build_detached_state(&test_config(), clock).await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/status", "10.0.0.8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(request("GET", "/ready", "10.0.0.8")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_rate_limits_endpoint_reflects_overrides() {
    let mut config = test_config();
    config.overrides.insert(
        "chat".to_string(),
        PolicyOverride {
            window: None,
            window_ms: Some(30_000),
            max: Some(5),
        },
    );
    let (_, _, state) = setup_with(config).await;
    let app = create_app(state);

    let response = app
        .clone()
        .oneshot(request("GET", "/rate-limits", "10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["enabled"], true);

    let policies = json["policies"].as_array().unwrap();
    assert_eq!(policies.len(), 6);
    let chat = policies.iter().find(|p| p["name"] == "chat").unwrap();
    assert_eq!(chat["max"], 5);
    assert_eq!(chat["window"], "30s");

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(request("POST", "/chat/messages", "10.0.0.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app
        .oneshot(request("POST", "/chat/messages", "10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_policies_are_counted_independently() {
    let (_, _, app) = setup().await;

    for _ in 0..11 {
        app.clone()
            .oneshot(request("POST", "/auth/login", "10.0.0.10"))
            .await
            .unwrap();
    }

    let response = app
        .clone()
        .oneshot(request("POST", "/webhooks/payments", "10.0.0.10"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["ratelimit-limit"], "100");
    assert_eq!(response.headers()["ratelimit-remaining"], "99");
}

#[tokio::test]
async fn test_websocket_handshake_budget() {
    let (_, _, state) = setup_with(test_config()).await;
    let hub = state.hub;

    for _ in 0..10 {
        tokio_test::assert_ok!(hub.gate().on_handshake("ip:10.0.0.11").await);
    }
    let rejection = tokio_test::assert_err!(hub.gate().on_handshake("ip:10.0.0.11").await);
    assert!(rejection.retry_after > 0);

    // Budgets are per identity.
    tokio_test::assert_ok!(hub.gate().on_handshake("ip:10.0.0.12").await);
}

#[tokio::test]
async fn test_forwarded_header_ignored_without_trusted_proxy() {
    let config = Config {
        trust_proxy: false,
        ..test_config()
    };
    let (_, _, state) = setup_with(config).await;
    let app = create_app(state);
    let peer: std::net::SocketAddr = "192.0.2.7:50000".parse().unwrap();

    let spoofed = |i: u32| {
        let mut req = request("POST", "/auth/login", &format!("198.51.100.{}", i));
        req.extensions_mut().insert(axum::extract::ConnectInfo(peer));
        req
    };

    for i in 0..10 {
        let response = app.clone().oneshot(spoofed(i)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(spoofed(10)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
