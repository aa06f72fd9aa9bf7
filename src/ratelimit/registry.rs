//! Concurrent registry of per-key token buckets.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::quota::Quota;

/// Entries examined by one sweep triggered from the request path.
const SWEEP_BATCH: usize = 256;

/// Idle-bucket eviction policy.
#[derive(Debug)]
struct IdleEviction {
    /// Minimum time a bucket must go unused before it can be dropped
    idle_ttl: Duration,
    /// Minimum time between two sweeps
    sweep_interval: Duration,
    /// When the last sweep ran
    last_sweep: Mutex<Instant>,
    /// Position where the next batched sweep resumes
    cursor: AtomicUsize,
}

/// Maps client keys to their token buckets.
///
/// Lookups of existing keys only take a read lock on the shard owning the
/// key, and first-time inserts lock that shard alone, so unrelated clients
/// rarely contend. A key never has more than one live bucket.
#[derive(Debug)]
pub struct BucketRegistry {
    /// Parameters for every bucket created here
    quota: Quota,
    /// Buckets indexed by client key
    buckets: DashMap<String, Arc<TokenBucket>>,
    /// Optional idle eviction; `None` keeps buckets for the registry's lifetime
    eviction: Option<IdleEviction>,
}

impl BucketRegistry {
    /// Create an empty registry that never evicts.
    pub fn new(quota: Quota) -> Self {
        Self {
            quota,
            buckets: DashMap::new(),
            eviction: None,
        }
    }

    /// Enable opportunistic eviction of buckets idle for at least `idle_ttl`.
    ///
    /// Sweeps piggyback on [`get_or_create`](Self::get_or_create) at most once
    /// per `sweep_interval`; no background task is spawned. The request that
    /// triggers a sweep pays for it: it examines at most 256 entries, resuming
    /// where the previous sweep stopped, under shard read locks, and then
    /// write-locks one key at a time to remove what it found. Reclaiming a
    /// large backlog therefore takes several intervals;
    /// [`evict_idle_at`](Self::evict_idle_at) scans everything at once.
    pub fn with_idle_eviction(mut self, idle_ttl: Duration, sweep_interval: Duration) -> Self {
        self.eviction = Some(IdleEviction {
            idle_ttl,
            sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
            cursor: AtomicUsize::new(0),
        });
        self
    }

    /// Get the bucket for `key`, creating it on first sight.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        self.get_or_create_at(key, Instant::now())
    }

    /// Get the bucket for `key` as of `now`, creating it on first sight.
    pub fn get_or_create_at(&self, key: &str, now: Instant) -> Arc<TokenBucket> {
        self.maybe_sweep(now);

        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        // The entry holds the shard write lock across check and insert, so
        // racing first requests for one key end up sharing a single bucket.
        let entry = self.buckets.entry(key.to_owned()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = self.quota.capacity(),
                refill_rate = self.quota.refill_rate(),
                "Creating new token bucket"
            );
            Arc::new(TokenBucket::new_at(self.quota, now))
        });
        Arc::clone(entry.value())
    }

    /// Get the bucket for `key` if one exists.
    pub fn get(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.get(key).map(|bucket| Arc::clone(bucket.value()))
    }

    /// Whether a bucket exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// Drop the bucket for `key` unless a caller still holds it.
    ///
    /// Returns the removed bucket, or `None` if `key` is absent or its bucket
    /// is in use. Removing a held bucket would let the next request create a
    /// second bucket for the same key while the first is still consumed from.
    pub fn remove(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.buckets
            .remove_if(key, |_, bucket| Arc::strong_count(bucket) == 1)
            .map(|(_, bucket)| bucket)
    }

    /// Drop every bucket not currently held by a caller.
    pub fn clear(&self) {
        self.buckets.retain(|_, bucket| Arc::strong_count(bucket) > 1);
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Parameters applied to new buckets.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Remove every bucket that is idle, refilled and unreferenced.
    ///
    /// Returns the number of evicted buckets, or 0 when eviction is not
    /// configured. Scans the whole registry.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let Some(eviction) = &self.eviction else {
            return 0;
        };

        let (_, evicted) = self.evict_from(0, usize::MAX, eviction.idle_ttl, now);
        evicted
    }

    /// Examine up to `limit` entries starting at position `skip` and evict
    /// the reclaimable ones. Returns `(examined, evicted)`.
    fn evict_from(
        &self,
        skip: usize,
        limit: usize,
        idle_ttl: Duration,
        now: Instant,
    ) -> (usize, usize) {
        let mut examined = 0;
        let mut candidates = Vec::new();
        // Shards are only read-locked here, one at a time. The iterator must
        // be dropped before removing, which write-locks the same shards.
        for entry in self.buckets.iter().skip(skip).take(limit) {
            examined += 1;
            if Arc::strong_count(entry.value()) == 1
                && entry.value().is_reclaimable_at(now, idle_ttl)
            {
                candidates.push(entry.key().clone());
            }
        }

        // Recheck under the key's write lock: a lookup may have cloned the
        // bucket or consumed from it since the scan.
        let evicted = candidates
            .iter()
            .filter(|key| {
                self.buckets
                    .remove_if(key.as_str(), |_, bucket| {
                        Arc::strong_count(bucket) == 1 && bucket.is_reclaimable_at(now, idle_ttl)
                    })
                    .is_some()
            })
            .count();

        if evicted > 0 {
            debug!(
                evicted = evicted,
                remaining = self.buckets.len(),
                "Evicted idle token buckets"
            );
        }
        (examined, evicted)
    }

    fn maybe_sweep(&self, now: Instant) {
        let Some(eviction) = &self.eviction else {
            return;
        };

        // Another caller is already sweeping.
        let Some(mut last_sweep) = eviction.last_sweep.try_lock() else {
            return;
        };
        if now.saturating_duration_since(*last_sweep) < eviction.sweep_interval {
            return;
        }
        *last_sweep = now;

        let start = eviction.cursor.load(Ordering::Relaxed);
        trace!(
            buckets = self.buckets.len(),
            start = start,
            "Sweeping idle token buckets"
        );
        let (examined, evicted) = self.evict_from(start, SWEEP_BATCH, eviction.idle_ttl, now);

        // Wrap around once the end of the map is reached. Evicted entries
        // no longer occupy a position, so the cursor only skips survivors.
        let next = if examined < SWEEP_BATCH {
            0
        } else {
            start + examined - evicted
        };
        eviction.cursor.store(next, Ordering::Relaxed);
    }
}
