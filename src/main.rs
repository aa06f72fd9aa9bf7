use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::{HttpServer, RateLimitState};
use tollgate::ratelimit::{LimitScope, RateLimiter};

/// Token bucket rate limiting HTTP service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Maximum burst size per bucket
    #[arg(long)]
    capacity: Option<f64>,

    /// Permits granted per second
    #[arg(long)]
    refill_rate: Option<f64>,

    /// Share one bucket between all clients
    #[arg(long)]
    global: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<TollgateConfig> {
        let mut config = match &self.config {
            Some(path) => TollgateConfig::from_file(path)?,
            None => TollgateConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(capacity) = self.capacity {
            config.rate_limiting.capacity = capacity;
        }
        if let Some(refill_rate) = self.refill_rate {
            config.rate_limiting.refill_rate = refill_rate;
        }
        if self.global {
            config.rate_limiting.scope = LimitScope::Global;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = args.load_config()?;
    info!(
        listen_addr = %config.server.listen_addr,
        capacity = config.rate_limiting.capacity,
        refill_rate = config.rate_limiting.refill_rate,
        scope = ?config.rate_limiting.scope,
        "Configuration loaded"
    );

    // Initialize the rate limiter
    let rate_limiter = Arc::new(RateLimiter::from_config(&config.rate_limiting)?);
    info!("Rate limiter initialized");

    let state = RateLimitState::new(rate_limiter, config.rate_limiting.key_source.clone());
    let server = HttpServer::new(config.server.listen_addr, state);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
