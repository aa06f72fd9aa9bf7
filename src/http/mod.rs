//! HTTP binding: client key extraction, rate limiting middleware and server.

mod key;
mod middleware;
mod server;

pub use key::KeySource;
pub use middleware::{limit, rate_limit, RateLimitState};
pub use server::HttpServer;
