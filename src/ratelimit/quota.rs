//! Validated bucket parameters.

use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Capacity and refill rate shared by every bucket a registry creates.
///
/// A `Quota` can only be obtained through its validating constructors, so
/// holding one proves both values are usable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    capacity: f64,
    refill_rate: f64,
}

impl Quota {
    /// Create a quota holding up to `capacity` permits and granting
    /// `refill_rate` permits per second.
    ///
    /// A capacity below one permit is rejected: each admission takes a whole
    /// permit, so such a bucket would deny every request.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity < 1.0 {
            return Err(TollgateError::InvalidCapacity(capacity));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(TollgateError::InvalidRefillRate(refill_rate));
        }
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    /// Create a quota allowing `requests` per `interval`, with a burst of
    /// `requests`.
    ///
    /// `Quota::per_interval(100, Duration::from_secs(3600))` refills at
    /// 100/3600 permits per second.
    pub fn per_interval(requests: u32, interval: Duration) -> Result<Self> {
        if requests == 0 {
            return Err(TollgateError::InvalidInterval(
                "requests per interval must be greater than 0".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(TollgateError::InvalidInterval(
                "interval must be longer than zero".to_string(),
            ));
        }
        let requests = f64::from(requests);
        Self::new(requests, requests / interval.as_secs_f64())
    }

    /// Maximum number of permits a bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Permits granted per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}
