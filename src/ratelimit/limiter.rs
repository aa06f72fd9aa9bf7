//! Core rate limiter implementation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::RateLimitingConfig;
use crate::error::{Result, TollgateError};

use super::bucket::Decision;
use super::quota::Quota;
use super::registry::BucketRegistry;

/// Registry key of the bucket shared by all callers in global mode.
pub const GLOBAL_KEY: &str = "global";

/// How requests are grouped into buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// One bucket per client key
    #[default]
    PerClient,
    /// One bucket shared by every caller
    Global,
}

impl LimitScope {
    /// Map a "keyed" flag onto a scope.
    pub fn from_keyed(keyed: bool) -> Self {
        if keyed {
            LimitScope::PerClient
        } else {
            LimitScope::Global
        }
    }

    /// Whether requests are limited per client key.
    pub fn is_keyed(&self) -> bool {
        matches!(self, LimitScope::PerClient)
    }
}

/// The rate limiter that answers admission checks.
///
/// This struct is thread-safe and can be shared across multiple tasks. It
/// exclusively owns its [`BucketRegistry`], which in turn owns every bucket.
#[derive(Debug)]
pub struct RateLimiter {
    /// Per-client or global limiting
    scope: LimitScope,
    /// Buckets indexed by client key
    registry: BucketRegistry,
}

impl RateLimiter {
    /// Create a rate limiter applying `quota` to each bucket.
    pub fn new(quota: Quota, scope: LimitScope) -> Self {
        Self {
            scope,
            registry: BucketRegistry::new(quota),
        }
    }

    /// Create a rate limiter from the rate limiting section of the config.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        let quota = Quota::new(config.capacity, config.refill_rate)?;
        let limiter = Self::new(quota, config.scope);

        Ok(match config.idle_ttl() {
            Some(idle_ttl) => limiter.with_idle_eviction(idle_ttl, config.sweep_interval()),
            None => limiter,
        })
    }

    /// Evict buckets idle for at least `idle_ttl`, checked at most once per
    /// `sweep_interval`.
    pub fn with_idle_eviction(mut self, idle_ttl: Duration, sweep_interval: Duration) -> Self {
        self.registry = self.registry.with_idle_eviction(idle_ttl, sweep_interval);
        self
    }

    /// Decide whether a request from `client_key` may proceed.
    ///
    /// In global mode the key is ignored. In per-client mode a missing key
    /// is a [`TollgateError::KeyExtraction`] error; it is never reported as a
    /// denial nor charged to the global bucket.
    pub fn decide(&self, client_key: Option<&str>) -> Result<Decision> {
        self.decide_with(client_key, None)
    }

    /// Decide whether a request from `client_key` may proceed as of `now`.
    pub fn decide_at(&self, client_key: Option<&str>, now: Instant) -> Result<Decision> {
        self.decide_with(client_key, Some(now))
    }

    /// Without an explicit `now`, the bucket reads the clock once it holds
    /// its lock, so refill times never go backwards between callers.
    fn decide_with(&self, client_key: Option<&str>, now: Option<Instant>) -> Result<Decision> {
        let key = self.bucket_key(client_key)?;

        let bucket = self
            .registry
            .get_or_create_at(key, now.unwrap_or_else(Instant::now));
        let decision = match now {
            Some(now) => bucket.try_consume_at(now),
            None => bucket.try_consume(),
        };

        trace!(
            key = %key,
            admitted = decision.is_admitted(),
            "Checked rate limit"
        );

        if let Decision::Denied { retry_after } = decision {
            debug!(
                key = %key,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    fn bucket_key<'a>(&self, client_key: Option<&'a str>) -> Result<&'a str> {
        match (self.scope, client_key) {
            (LimitScope::Global, _) => Ok(GLOBAL_KEY),
            (LimitScope::PerClient, Some(key)) => Ok(key),
            (LimitScope::PerClient, None) => Err(TollgateError::KeyExtraction(
                "no client key provided for per-client rate limiting".to_string(),
            )),
        }
    }

    /// Per-client or global limiting.
    pub fn scope(&self) -> LimitScope {
        self.scope
    }

    /// Parameters applied to each bucket.
    pub fn quota(&self) -> Quota {
        self.registry.quota()
    }

    /// Available permits for a key, or `None` if it has no bucket yet.
    pub fn available_tokens(&self, client_key: &str) -> Option<f64> {
        self.registry
            .get(client_key)
            .map(|bucket| bucket.available_tokens())
    }

    /// Refill the bucket for `client_key` to capacity.
    ///
    /// The bucket is refilled in place, so a caller already holding it and
    /// later requests keep sharing one bucket. Returns `false` if the key has
    /// no bucket.
    pub fn reset(&self, client_key: &str) -> bool {
        self.reset_at(client_key, Instant::now())
    }

    /// Refill the bucket for `client_key` to capacity as of `now`.
    pub fn reset_at(&self, client_key: &str, now: Instant) -> bool {
        match self.registry.get(client_key) {
            Some(bucket) => {
                bucket.reset_at(now);
                debug!(key = %client_key, "Reset token bucket");
                true
            }
            None => false,
        }
    }

    /// Run an idle-eviction sweep now, returning the number of evicted buckets.
    pub fn evict_idle(&self) -> usize {
        self.registry.evict_idle_at(Instant::now())
    }

    /// Clear all buckets not currently held by a caller.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Get the number of active buckets.
    pub fn bucket_count(&self) -> usize {
        self.registry.len()
    }
}
