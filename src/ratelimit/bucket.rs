//! Token bucket implementation.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::quota::Quota;

/// Slack absorbed when comparing the token level against one permit.
///
/// Refill is `elapsed * rate` in floating point, so a caller that waits
/// exactly the reported `retry_after` can land a few ulps short of a whole
/// permit.
const TOKEN_EPSILON: f64 = 1e-9;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// One permit was consumed and the request may proceed.
    Admitted,
    /// No permit was available; nothing was consumed.
    Denied {
        /// Time until the bucket accrues its next whole permit.
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }

    /// How long the caller should wait before retrying.
    ///
    /// Zero for admitted requests.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Admitted => Duration::ZERO,
            Decision::Denied { retry_after } => *retry_after,
        }
    }
}

/// A capacity-bounded pool of permits refilled continuously over time.
///
/// Refill is evaluated lazily on every access from the time elapsed since
/// the previous access, so a bucket needs no background task. All state is
/// behind one mutex: refill, the admission check and the consumption form
/// a single critical section.
pub struct TokenBucket {
    /// Capacity and refill rate
    quota: Quota,
    /// Token level as of `last_refill`
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Available permits, always within `[0, capacity]`
    tokens: f64,
    /// When `tokens` was last brought up to date
    last_refill: Instant,
}

impl BucketState {
    /// Bring `tokens` up to date as of `now`.
    ///
    /// A `now` older than `last_refill` counts as no elapsed time; this
    /// happens when callers read the clock before racing for the lock.
    fn refill(&mut self, quota: &Quota, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * quota.refill_rate()).min(quota.capacity());
        self.last_refill = now;
    }

    fn tokens_at(&self, quota: &Quota, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * quota.refill_rate()).min(quota.capacity())
    }
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(quota: Quota) -> Self {
        Self::new_at(quota, Instant::now())
    }

    /// Create a full bucket whose refill clock starts at `now`.
    pub fn new_at(quota: Quota, now: Instant) -> Self {
        Self {
            quota,
            state: Mutex::new(BucketState {
                tokens: quota.capacity(),
                last_refill: now,
            }),
        }
    }

    /// Try to take one permit now.
    pub fn try_consume(&self) -> Decision {
        let mut state = self.state.lock();
        // The clock is read under the lock so concurrent callers observe
        // monotonically increasing refill times.
        let now = Instant::now();
        self.consume_locked(&mut state, now)
    }

    /// Try to take one permit as of `now`.
    pub fn try_consume_at(&self, now: Instant) -> Decision {
        let mut state = self.state.lock();
        self.consume_locked(&mut state, now)
    }

    fn consume_locked(&self, state: &mut BucketState, now: Instant) -> Decision {
        state.refill(&self.quota, now);

        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            return Decision::Admitted;
        }

        let missing = 1.0 - state.tokens;
        let nanos = (missing / self.quota.refill_rate() * 1e9).ceil();
        Decision::Denied {
            retry_after: Duration::from_nanos(nanos as u64),
        }
    }

    /// Refill the bucket to capacity as of `now`.
    pub fn reset_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.tokens = self.quota.capacity();
        state.last_refill = state.last_refill.max(now);
    }

    /// Current number of available permits.
    pub fn available_tokens(&self) -> f64 {
        self.available_tokens_at(Instant::now())
    }

    /// Number of available permits as of `now`, without consuming any.
    pub fn available_tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        state.refill(&self.quota, now);
        state.tokens
    }

    /// Time since this bucket was last accessed.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_refill)
    }

    /// Whether the bucket will have refilled to capacity by `now`.
    pub fn is_full_at(&self, now: Instant) -> bool {
        let state = self.state.lock();
        state.tokens_at(&self.quota, now) >= self.quota.capacity()
    }

    /// Whether the bucket has been untouched for `idle_ttl` and is back at
    /// capacity, so that dropping and recreating it is unobservable.
    ///
    /// Returns `false` without waiting if another caller holds the bucket.
    pub(crate) fn is_reclaimable_at(&self, now: Instant, idle_ttl: Duration) -> bool {
        let Some(state) = self.state.try_lock() else {
            return false;
        };
        now.saturating_duration_since(state.last_refill) >= idle_ttl
            && state.tokens_at(&self.quota, now) >= self.quota.capacity()
    }

    /// Maximum number of permits this bucket holds.
    pub fn capacity(&self) -> f64 {
        self.quota.capacity()
    }

    /// Permits granted per second.
    pub fn refill_rate(&self) -> f64 {
        self.quota.refill_rate()
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TokenBucket")
            .field("capacity", &self.quota.capacity())
            .field("refill_rate", &self.quota.refill_rate())
            .field("tokens", &state.tokens)
            .field("last_refill", &state.last_refill)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    fn bucket(capacity: f64, refill_rate: f64, now: Instant) -> TokenBucket {
        TokenBucket::new_at(Quota::new(capacity, refill_rate).unwrap(), now)
    }

    #[test]
    fn test_burst_up_to_capacity() {
        let start = Instant::now();
        let bucket = bucket(5.0, 1.0, start);

        for i in 0..5 {
            assert!(
                bucket.try_consume_at(start).is_admitted(),
                "request {} should be admitted",
                i
            );
        }

        // The 6th request should be denied
        assert!(!bucket.try_consume_at(start).is_admitted());
    }

    #[test]
    fn test_denial_reports_time_to_next_permit() {
        let start = Instant::now();
        let bucket = bucket(1.0, 0.1, start);

        assert_eq!(bucket.try_consume_at(start), Decision::Admitted);

        let retry_after = bucket.try_consume_at(start).retry_after();
        assert!(retry_after > Duration::from_millis(9_999));
        assert!(retry_after <= Duration::from_millis(10_001));
    }

    #[test]
    fn test_denial_does_not_consume() {
        let start = Instant::now();
        let bucket = bucket(1.0, 1.0, start);
        bucket.try_consume_at(start);

        let half = start + Duration::from_millis(500);
        let first = bucket.try_consume_at(half);
        let second = bucket.try_consume_at(half);

        assert_eq!(first, second);
        assert!((bucket.available_tokens_at(half) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_retry_after_reported_wait_is_admitted() {
        for rate in [0.1, 0.3, 1.0, 7.0, 1000.0] {
            let start = Instant::now();
            let bucket = bucket(1.0, rate, start);
            bucket.try_consume_at(start);

            let later = start + Duration::from_millis(37);
            let retry_after = bucket.try_consume_at(later).retry_after();
            if retry_after.is_zero() {
                continue;
            }

            let retry_at = later + retry_after;
            assert!(
                bucket.try_consume_at(retry_at).is_admitted(),
                "rate {} should admit after {:?}",
                rate,
                retry_after
            );
        }
    }

    #[test]
    fn test_refill_saturates_at_capacity() {
        let start = Instant::now();
        let bucket = bucket(3.0, 100.0, start);

        let much_later = start + Duration::from_secs(86_400);
        assert_eq!(bucket.available_tokens_at(much_later), 3.0);

        for _ in 0..3 {
            assert!(bucket.try_consume_at(much_later).is_admitted());
        }
        assert!(!bucket.try_consume_at(much_later).is_admitted());
    }

    #[test]
    fn test_stale_timestamp_does_not_refill() {
        let start = Instant::now();
        let later = start + Duration::from_secs(5);
        let bucket = bucket(1.0, 1.0, start);

        assert!(bucket.try_consume_at(later).is_admitted());
        // A caller that read the clock before `later` must not refill
        assert!(!bucket.try_consume_at(start).is_admitted());
        assert!(!bucket.try_consume_at(later).is_admitted());
    }

    #[test]
    fn test_fractional_refill_accumulates() {
        let start = Instant::now();
        let bucket = bucket(1.0, 1.0, start);
        bucket.try_consume_at(start);

        let mut now = start;
        for _ in 0..3 {
            now += Duration::from_millis(250);
            assert!(!bucket.try_consume_at(now).is_admitted());
        }
        now += Duration::from_millis(250);
        assert!(bucket.try_consume_at(now).is_admitted());
    }

    #[test]
    fn test_reset_refills_without_rewinding_clock() {
        let start = Instant::now();
        let later = start + Duration::from_secs(5);
        let bucket = bucket(2.0, 0.1, start);

        bucket.try_consume_at(later);
        bucket.try_consume_at(later);
        assert!(!bucket.try_consume_at(later).is_admitted());

        // A stale reset time still refills but keeps the newer refill clock
        bucket.reset_at(start);
        assert_eq!(bucket.available_tokens_at(later), 2.0);
        assert_eq!(bucket.idle_for(later), Duration::ZERO);
    }

    #[test]
    fn test_idle_and_full() {
        let start = Instant::now();
        let bucket = bucket(2.0, 1.0, start);
        bucket.try_consume_at(start);

        assert!(!bucket.is_full_at(start));
        assert!(bucket.is_full_at(start + Duration::from_secs(1)));
        assert_eq!(bucket.idle_for(start + Duration::from_secs(4)), Duration::from_secs(4));

        assert!(!bucket.is_reclaimable_at(start + Duration::from_secs(1), Duration::from_secs(2)));
        assert!(bucket.is_reclaimable_at(start + Duration::from_secs(2), Duration::from_secs(2)));
    }

    #[test]
    fn test_concurrent_single_permit_admits_once() {
        const CALLERS: usize = 16;
        let bucket = Arc::new(bucket(1.0, 0.001, Instant::now()));
        let barrier = Arc::new(Barrier::new(CALLERS));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let barrier = Arc::clone(&barrier);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    barrier.wait();
                    if bucket.try_consume().is_admitted() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decision_accessors() {
        assert!(Decision::Admitted.is_admitted());
        assert_eq!(Decision::Admitted.retry_after(), Duration::ZERO);

        let denied = Decision::Denied {
            retry_after: Duration::from_secs(3),
        };
        assert!(!denied.is_admitted());
        assert_eq!(denied.retry_after(), Duration::from_secs(3));
    }
}
