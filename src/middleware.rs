use crate::key_generator::RequestContext;
use crate::rate_limiter::{HttpPolicy, RateLimitDecision, RateLimitInfo, RateLimiterRegistry};
use crate::response::RejectionBody;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::info;

/// State for one policy layer.
#[derive(Clone)]
pub struct PolicyGuard {
    pub registry: Arc<RateLimiterRegistry>,
    pub policy: HttpPolicy,
    pub trust_proxy: bool,
}

impl PolicyGuard {
    pub fn new(registry: Arc<RateLimiterRegistry>, policy: HttpPolicy) -> Self {
        Self {
            registry,
            policy,
            trust_proxy: true,
        }
    }

    pub fn trust_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }
}

/// Applies one named policy; rejected requests never reach the handler.
///
/// Mount with `axum::middleware::from_fn_with_state(PolicyGuard::new(..), enforce_policy)`.
/// When guards are stacked, the innermost policy that counted the request
/// owns the `RateLimit-*` headers.
pub async fn enforce_policy(
    State(guard): State<PolicyGuard>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::from_request_with(&request, guard.trust_proxy);

    match guard.registry.evaluate(guard.policy, &ctx).await {
        RateLimitDecision::Bypass => next.run(request).await,
        RateLimitDecision::Proceed(limit) => {
            let mut response = next.run(request).await;
            if !response.headers().contains_key(LIMIT_HEADER) {
                insert_limit_headers(response.headers_mut(), &limit);
            }
            response
        }
        RateLimitDecision::Rejected {
            info,
            retry_after,
            message,
        } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(RejectionBody::new(message, retry_after)),
            )
                .into_response();
            let headers = response.headers_mut();
            insert_limit_headers(headers, &info);
            set_header(headers, "retry-after", retry_after);
            response
        }
    }
}

const LIMIT_HEADER: &str = "ratelimit-limit";

fn insert_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    set_header(headers, LIMIT_HEADER, info.limit);
    set_header(headers, "ratelimit-remaining", info.remaining);
    set_header(headers, "ratelimit-reset", info.reset_after);
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: u64) {
    headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = RequestContext::from_request(&request).client_ip;

    info!(
        target: "clustered_throttler::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "clustered_throttler::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}
