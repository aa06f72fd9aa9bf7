//! Tollgate - Token Bucket Rate Limiting
//!
//! This crate limits the rate at which a server processes requests. Each
//! client key gets its own token bucket (or all callers share one in global
//! mode); buckets refill lazily from elapsed time and are kept in a
//! concurrent registry. An axum middleware turns decisions into `429`
//! responses.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
