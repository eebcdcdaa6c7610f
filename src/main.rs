use anyhow::Result;
use clap::Parser;
use clustered_throttler::clock::{Clock, SystemClock};
use clustered_throttler::config::{Backend, Config};
use clustered_throttler::server::{build_detached_state, build_state, connector_for, Server};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "clustered-throttler", version, about = "Cluster-backed rate limiting service")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<SocketAddr>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Cluster backend
    #[arg(long, value_enum, env = "CLUSTER_BACKEND")]
    backend: Option<Backend>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut overrides = HashMap::new();
    if let Some(addr) = cli.bind_addr {
        overrides.insert("BIND_ADDR".to_string(), addr.to_string());
    }
    if let Some(level) = &cli.log_level {
        overrides.insert("LOG_LEVEL".to_string(), level.clone());
    }
    if let Some(backend) = cli.backend {
        overrides.insert("CLUSTER_BACKEND".to_string(), backend.as_str().to_string());
    }
    let loaded = Config::from_env_with(&overrides);

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| loaded.as_ref().ok().map(|c| c.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("clustered_throttler={},tower_http=debug", log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting clustered throttler");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (bind_addr, state) = match loaded {
        Ok(config) => {
            tracing::info!(
                backend = ?config.backend,
                endpoint = ?config.endpoint,
                bind_addr = %config.bind_addr,
                "Configuration loaded"
            );
            let connector = connector_for(&config, clock.clone());
            (config.bind_addr, build_state(&config, connector, clock).await)
        }
        Err(e) if e.is_startup_fatal() => {
            tracing::error!(error = %e, "Cluster configuration rejected");
            let mut config = Config::default();
            if let Some(addr) = cli.bind_addr {
                config.bind_addr = addr;
            }
            (config.bind_addr, build_detached_state(&config, clock).await)
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to load configuration: {}", e)),
    };

    Server::new(bind_addr, state)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
