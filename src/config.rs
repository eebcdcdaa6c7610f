use crate::error::{Result, ThrottlerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Which transport backs the coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Redis,
    /// Process-local cluster emulation; for development and tests.
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Redis => "redis",
            Backend::Memory => "memory",
        }
    }
}

impl FromStr for Backend {
    type Err = ThrottlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "memory" => Ok(Backend::Memory),
            other => Err(ThrottlerError::Configuration(format!(
                "unknown CLUSTER_BACKEND '{}', expected 'redis' or 'memory'",
                other
            ))),
        }
    }
}

/// Where the cluster lives. Immutable once the process has started.
#[derive(Clone, Validate)]
pub struct ClusterEndpoint {
    #[validate(length(min = 1, message = "cluster host cannot be empty"))]
    pub host: String,
    #[validate(range(min = 1, message = "cluster port must be greater than 0"))]
    pub port: u16,
    pub credential: Option<String>,
    pub tls: bool,
}

impl ClusterEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credential: None,
            tls: false,
        }
    }

    /// Connection URL without the credential; the credential is applied separately.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        format!("{}://{}:{}/", scheme, self.host, self.port)
    }
}

impl fmt::Debug for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

/// Per-policy window/max override, e.g. `{"auth": {"window": "5m", "max": 20}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default, with = "humantime_serde")]
    pub window: Option<Duration>,
    #[serde(default, rename = "windowMs")]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
}

impl PolicyOverride {
    pub fn effective_window(&self) -> Option<Duration> {
        self.window_ms.map(Duration::from_millis).or(self.window)
    }
}

#[derive(Debug, Clone, Validate)]
pub struct Config {
    #[validate(nested)]
    pub endpoint: ClusterEndpoint,

    pub backend: Backend,

    /// Server bind address
    pub bind_addr: SocketAddr,

    #[validate(length(min = 1))]
    pub log_level: String,

    /// Bounds the initial handshake of each connect attempt
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Bounds every individual cluster command
    #[validate(range(min = 1))]
    pub command_timeout_ms: u64,

    /// Attempts made by the startup connect loop before giving up
    #[validate(range(min = 1, max = 100))]
    pub max_reconnect_attempts: u32,

    /// Backoff before retry n is `reconnect_base_delay_ms * n`
    #[validate(range(min = 1))]
    pub reconnect_base_delay_ms: u64,

    /// Pause between tearing down an old connection and opening a new one
    pub quiescence_ms: u64,

    /// How often a degraded connection is pinged for recovery
    #[validate(range(min = 10))]
    pub health_check_interval_ms: u64,

    /// Run the canary write/read after connecting
    pub self_test: bool,

    #[validate(length(min = 1))]
    pub key_prefix: String,

    /// Take the client address from `x-forwarded-for` / `x-real-ip`.
    /// Only safe behind a proxy that overwrites those headers.
    pub trust_proxy: bool,

    pub overrides: HashMap<String, PolicyOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: ClusterEndpoint::new("127.0.0.1", 6379),
            backend: Backend::Redis,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            log_level: "info".to_string(),
            connect_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            quiescence_ms: 100,
            health_check_interval_ms: 5_000,
            self_test: true,
            key_prefix: "rl:".to_string(),
            trust_proxy: true,
            overrides: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Config::from_env`], with `overrides` (e.g. command-line values)
    /// taking precedence over the environment.
    pub fn from_env_with(overrides: &HashMap<String, String>) -> Result<Self> {
        Self::from_layers(overrides, |name| std::env::var(name).ok())
    }

    /// Resolves each variable from `overrides` first, then from `lookup`.
    pub fn from_layers<F>(overrides: &HashMap<String, String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::from_lookup(|name| overrides.get(name).cloned().or_else(|| lookup(name)))
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend = match var("CLUSTER_BACKEND") {
            Some(raw) => raw.parse()?,
            None => defaults.backend,
        };

        let host = match (var("CLUSTER_HOST"), backend) {
            (Some(host), _) => host,
            (None, Backend::Memory) => defaults.endpoint.host.clone(),
            (None, Backend::Redis) => {
                return Err(ThrottlerError::Configuration(
                    "CLUSTER_HOST is required".to_string(),
                ))
            }
        };

        let endpoint = ClusterEndpoint {
            host,
            port: parse_or(&var, "CLUSTER_PORT", defaults.endpoint.port)?,
            credential: var("CLUSTER_CREDENTIAL"),
            tls: parse_bool_or(&var, "CLUSTER_TLS", false)?,
        };

        let overrides = match var("RATE_LIMIT_OVERRIDES") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                ThrottlerError::Configuration(format!("invalid RATE_LIMIT_OVERRIDES: {}", e))
            })?,
            None => HashMap::new(),
        };

        let config = Config {
            endpoint,
            backend,
            bind_addr: parse_or(&var, "BIND_ADDR", defaults.bind_addr)?,
            log_level: var("LOG_LEVEL").unwrap_or(defaults.log_level),
            connect_timeout_ms: parse_or(&var, "CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            command_timeout_ms: parse_or(&var, "COMMAND_TIMEOUT_MS", defaults.command_timeout_ms)?,
            max_reconnect_attempts: parse_or(
                &var,
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            reconnect_base_delay_ms: parse_or(
                &var,
                "RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            )?,
            quiescence_ms: parse_or(&var, "QUIESCENCE_MS", defaults.quiescence_ms)?,
            health_check_interval_ms: parse_or(
                &var,
                "HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval_ms,
            )?,
            self_test: parse_bool_or(&var, "SELF_TEST", defaults.self_test)?,
            key_prefix: var("KEY_PREFIX").unwrap_or(defaults.key_prefix),
            trust_proxy: parse_bool_or(&var, "TRUST_PROXY", defaults.trust_proxy)?,
            overrides,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

fn parse_or<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            ThrottlerError::Configuration(format!("invalid {} '{}': {}", name, raw, e))
        }),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(var: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ThrottlerError::Configuration(format!(
            "invalid {} '{}': expected a boolean",
            name, v
        ))),
        None => Ok(default),
    }
}
