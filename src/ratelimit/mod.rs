//! Token bucket rate limiting and bucket state management.

mod bucket;
mod limiter;
mod quota;
mod registry;

pub use bucket::{Decision, TokenBucket};
pub use limiter::{LimitScope, RateLimiter, GLOBAL_KEY};
pub use quota::Quota;
pub use registry::BucketRegistry;
