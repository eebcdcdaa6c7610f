pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_limiter;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod middleware;
pub mod rate_limiter;
pub mod realtime;
pub mod response;
pub mod server;
pub mod store;
pub mod transport;

pub use config::Config;
pub use connection::{ClusterConnectionManager, ClusterReply, ConnectionState};
pub use error::{Result, ThrottlerError};
pub use event_limiter::EventRateLimiterRegistry;
pub use rate_limiter::RateLimiterRegistry;
pub use server::create_app;
pub use store::RateLimitStore;
