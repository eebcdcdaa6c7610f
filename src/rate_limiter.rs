//! Named HTTP limiter policies over the shared fixed-window store.

use crate::config::PolicyOverride;
use crate::key_generator::{KeyStrategy, RequestContext};
use crate::store::RateLimitStore;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpPolicy {
    Global,
    Auth,
    Api,
    Upload,
    Chat,
    Webhook,
}

impl HttpPolicy {
    pub const ALL: [HttpPolicy; 6] = [
        HttpPolicy::Global,
        HttpPolicy::Auth,
        HttpPolicy::Api,
        HttpPolicy::Upload,
        HttpPolicy::Chat,
        HttpPolicy::Webhook,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HttpPolicy::Global => "global",
            HttpPolicy::Auth => "auth",
            HttpPolicy::Api => "api",
            HttpPolicy::Upload => "upload",
            HttpPolicy::Chat => "chat",
            HttpPolicy::Webhook => "webhook",
        }
    }

    fn default_policy(&self) -> LimiterPolicy {
        const MINUTE: u64 = 60;
        match self {
            HttpPolicy::Global => LimiterPolicy::new(
                *self,
                Duration::from_secs(15 * MINUTE),
                1000,
                KeyStrategy::IpAddress,
                "Too many requests from this IP, please try again later.",
            ),
            HttpPolicy::Auth => LimiterPolicy::new(
                *self,
                Duration::from_secs(15 * MINUTE),
                10,
                KeyStrategy::PrefixedIp("auth".to_string()),
                "Too many authentication attempts, please try again later.",
            ),
            HttpPolicy::Api => LimiterPolicy::new(
                *self,
                Duration::from_secs(15 * MINUTE),
                200,
                KeyStrategy::UserOrIp,
                "Too many API requests, please try again later.",
            ),
            HttpPolicy::Upload => LimiterPolicy::new(
                *self,
                Duration::from_secs(60 * MINUTE),
                50,
                KeyStrategy::UserOrIp,
                "Too many uploads, please try again later.",
            ),
            HttpPolicy::Chat => LimiterPolicy::new(
                *self,
                Duration::from_secs(MINUTE),
                60,
                KeyStrategy::UserOrIp,
                "Too many chat requests, please slow down.",
            ),
            HttpPolicy::Webhook => LimiterPolicy::new(
                *self,
                Duration::from_secs(MINUTE),
                100,
                KeyStrategy::IpAddress,
                "Too many webhook requests.",
            ),
        }
    }
}

impl fmt::Display for HttpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type SkipPredicate = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

/// Liveness and readiness checks are never counted.
pub fn skip_health_checks() -> SkipPredicate {
    Arc::new(|ctx: &RequestContext| matches!(ctx.path.as_str(), "/health" | "/ready"))
}

#[derive(Clone)]
pub struct LimiterPolicy {
    pub kind: HttpPolicy,
    pub window: Duration,
    pub max: u64,
    pub key: KeyStrategy,
    pub skip: SkipPredicate,
    pub message: String,
}

impl LimiterPolicy {
    pub fn new(kind: HttpPolicy, window: Duration, max: u64, key: KeyStrategy, message: &str) -> Self {
        Self {
            kind,
            window,
            max,
            key,
            skip: skip_health_checks(),
            message: message.to_string(),
        }
    }

    pub fn with_skip(mut self, skip: SkipPredicate) -> Self {
        self.skip = skip;
        self
    }

    fn apply(&mut self, overrides: &PolicyOverride) {
        if let Some(window) = overrides.effective_window() {
            self.window = window;
        }
        if let Some(max) = overrides.max {
            self.max = max;
        }
    }
}

impl fmt::Debug for LimiterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterPolicy")
            .field("kind", &self.kind)
            .field("window", &self.window)
            .field("max", &self.max)
            .field("key", &self.key)
            .finish()
    }
}

/// Limit metadata attached to a counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window closes.
    pub reset_time: u64,
    /// Whole seconds until the window closes.
    pub reset_after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Not evaluated: skipped path or limiter disabled.
    Bypass,
    Proceed(RateLimitInfo),
    Rejected {
        info: RateLimitInfo,
        retry_after: u64,
        message: String,
    },
}

impl RateLimitDecision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, RateLimitDecision::Rejected { .. })
    }
}

/// Serializable view of a policy.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDescription {
    pub name: &'static str,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub max: u64,
    pub key: String,
}

pub struct RateLimiterRegistry {
    store: RateLimitStore,
    policies: HashMap<HttpPolicy, LimiterPolicy>,
    enabled: bool,
}

impl RateLimiterRegistry {
    pub fn new(store: RateLimitStore, overrides: &HashMap<String, PolicyOverride>) -> Self {
        let policies = HttpPolicy::ALL
            .iter()
            .map(|kind| {
                let mut policy = kind.default_policy();
                if let Some(o) = overrides.get(kind.name()) {
                    policy.apply(o);
                    info!(
                        target: "clustered_throttler::rate_limiter",
                        policy = kind.name(),
                        window = ?policy.window,
                        max = policy.max,
                        "Applied policy override"
                    );
                }
                (*kind, policy)
            })
            .collect();

        Self {
            store,
            policies,
            enabled: true,
        }
    }

    /// A registry that lets everything through; used when the cluster never came up.
    pub fn disabled(store: RateLimitStore, overrides: &HashMap<String, PolicyOverride>) -> Self {
        let mut registry = Self::new(store, overrides);
        registry.enabled = false;
        registry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self, kind: HttpPolicy) -> &LimiterPolicy {
        &self.policies[&kind]
    }

    /// Replaces one policy, e.g. to install a custom skip predicate.
    pub fn set_policy(&mut self, policy: LimiterPolicy) {
        self.policies.insert(policy.kind, policy);
    }

    pub fn describe(&self) -> Vec<PolicyDescription> {
        HttpPolicy::ALL
            .iter()
            .map(|kind| {
                let policy = self.policy(*kind);
                PolicyDescription {
                    name: kind.name(),
                    window: policy.window,
                    max: policy.max,
                    key: format!("{:?}", policy.key),
                }
            })
            .collect()
    }

    pub async fn evaluate(&self, kind: HttpPolicy, ctx: &RequestContext) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::Bypass;
        }

        let policy = self.policy(kind);
        if (policy.skip)(ctx) {
            return RateLimitDecision::Bypass;
        }

        let key = policy.key.key_for(ctx);
        let result = self
            .store
            .increment(&format!("{}:{}", kind.name(), key), policy.window, policy.max)
            .await;

        let now = self.store.clock().now_ms();
        let reset_after = result.reset_time.saturating_sub(now).div_ceil(1000);
        let info = RateLimitInfo {
            limit: policy.max,
            remaining: result.remaining,
            reset_time: result.reset_time,
            reset_after,
        };

        if result.total_hits > policy.max {
            info!(
                target: "clustered_throttler::rate_limiter",
                policy = kind.name(),
                key = %key,
                hits = result.total_hits,
                retry_after = reset_after,
                "Rate limit exceeded"
            );
            return RateLimitDecision::Rejected {
                info,
                retry_after: reset_after.max(1),
                message: policy.message.clone(),
            };
        }

        debug!(
            target: "clustered_throttler::rate_limiter",
            policy = kind.name(),
            key = %key,
            remaining = result.remaining,
            "Request allowed"
        );
        RateLimitDecision::Proceed(info)
    }
}
