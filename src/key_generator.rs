//! Key generation utilities for rate limiting.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use std::net::SocketAddr;

/// Identity set by the authentication layer in front of the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// What a limiter policy gets to see of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: String,
    pub user_id: Option<String>,
    pub path: String,
}

impl RequestContext {
    pub fn new(client_ip: impl Into<String>, user_id: Option<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            user_id,
            path: path.into(),
        }
    }

    /// Trusts proxy headers; see [`RequestContext::from_request_with`].
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self::from_request_with(request, true)
    }

    pub fn from_request_with<B>(request: &Request<B>, trust_proxy: bool) -> Self {
        let socket = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Self {
            client_ip: client_address(request.headers(), socket, trust_proxy),
            user_id: request
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|user| user.0.clone()),
            path: request.uri().path().to_string(),
        }
    }
}

/// Strategy for generating rate limit keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Use client IP address
    IpAddress,
    /// Use the authenticated user, falling back to the client IP
    UserOrIp,
    /// Client IP under a fixed prefix, e.g. `auth:1.2.3.4`
    PrefixedIp(String),
}

impl KeyStrategy {
    pub fn key_for(&self, ctx: &RequestContext) -> String {
        match self {
            KeyStrategy::IpAddress => sanitize_key(&ctx.client_ip),
            KeyStrategy::UserOrIp => match ctx.user_id.as_deref() {
                Some(user) if !user.is_empty() => sanitize_key(user),
                _ => sanitize_key(&ctx.client_ip),
            },
            KeyStrategy::PrefixedIp(prefix) => format!("{}:{}", prefix, sanitize_key(&ctx.client_ip)),
        }
    }
}

/// Client address for limiting. Without `trust_proxy` the headers are
/// ignored, so a client cannot pick its own key by rotating them.
pub fn client_address(headers: &HeaderMap, socket: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        return extract_client_ip(headers, socket);
    }
    socket
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Client IP from proxy headers, then the socket address.
pub fn extract_client_ip(headers: &HeaderMap, socket: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(str::to_string)
        .or_else(|| socket.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Sanitize key components to ensure valid cluster keys
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;

    fn ctx(user: Option<&str>) -> RequestContext {
        RequestContext::new("192.168.1.1", user.map(str::to_string), "/api/test")
    }

    #[test]
    fn test_ip_address_strategy() {
        assert_eq!(KeyStrategy::IpAddress.key_for(&ctx(Some("u1"))), "192.168.1.1");
    }

    #[test]
    fn test_user_or_ip_strategy() {
        assert_eq!(KeyStrategy::UserOrIp.key_for(&ctx(Some("user123"))), "user123");
        assert_eq!(KeyStrategy::UserOrIp.key_for(&ctx(None)), "192.168.1.1");
        assert_eq!(KeyStrategy::UserOrIp.key_for(&ctx(Some(""))), "192.168.1.1");
    }

    #[test]
    fn test_prefixed_ip_strategy() {
        let strategy = KeyStrategy::PrefixedIp("auth".to_string());
        assert_eq!(strategy.key_for(&ctx(None)), "auth:192.168.1.1");
    }

    #[test]
    fn test_client_ip_with_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        assert_eq!(extract_client_ip(&headers, None), "192.168.1.1");
    }

    #[test]
    fn test_client_ip_with_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));
        assert_eq!(extract_client_ip(&headers, None), "203.0.113.1");
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let headers = HeaderMap::new();
        let socket: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        assert_eq!(extract_client_ip(&headers, Some(socket)), "10.1.2.3");
        assert_eq!(extract_client_ip(&headers, None), "unknown");
    }

    #[test]
    fn test_untrusted_proxy_headers_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        let socket: SocketAddr = "10.1.2.3:5555".parse().unwrap();

        assert_eq!(client_address(&headers, Some(socket), true), "1.1.1.1");
        assert_eq!(client_address(&headers, Some(socket), false), "10.1.2.3");

        let mut request = Request::builder()
            .uri("/auth/login")
            .header("x-forwarded-for", "9.9.9.9")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(socket));
        assert_eq!(RequestContext::from_request_with(&request, false).client_ip, "10.1.2.3");
        assert_eq!(RequestContext::from_request_with(&request, true).client_ip, "9.9.9.9");
    }

    #[test]
    fn test_context_from_request() {
        let mut request = Request::builder()
            .uri("/chat/messages?x=1")
            .header("x-real-ip", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(AuthenticatedUser("u42".to_string()));

        let ctx = RequestContext::from_request(&request);
        assert_eq!(ctx.client_ip, "203.0.113.9");
        assert_eq!(ctx.user_id.as_deref(), Some("u42"));
        assert_eq!(ctx.path, "/chat/messages");
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("test@key#with$special%chars"), "test_key_with_special_chars");
        assert_eq!(sanitize_key("2001:db8::1"), "2001:db8::1");
    }
}
