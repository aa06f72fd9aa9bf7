//! HTTP server implementation.

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{limit, RateLimitState};
use crate::error::{Result, TollgateError};

/// HTTP server fronting a rate-limited service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state shared by all connections
    state: RateLimitState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self { addr, state }
    }

    /// Build the service router.
    ///
    /// Every path except `/health` is rate limited and answers `OK` once
    /// admitted.
    pub fn router(state: RateLimitState) -> Router {
        let limited = Router::new().fallback(handle_ok);
        limit(limited, state).route("/health", get(handle_health))
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            scope = ?self.state.limiter().scope(),
            "Starting HTTP server"
        );

        let app = Self::router(self.state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

async fn handle_ok() -> &'static str {
    "OK"
}

async fn handle_health() -> &'static str {
    "ok"
}
