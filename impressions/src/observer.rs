//! Tracks when each distinct impression was last seen so the backend can
//! compute recurrence intervals. Shared by every synchronization pass.

use crate::metrics_defs::{DEDUP_CACHE_HIT, DEDUP_CACHE_MISS};
use crate::types::Impression;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use shared::counter;
use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};

pub const DEFAULT_CAPACITY: u64 = 500_000;

pub struct ImpressionObserver {
    cache: Cache<u64, i64>,
}

impl ImpressionObserver {
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        ImpressionObserver { cache }
    }

    /// Returns the time previously stored for `hash`, if any, and stores `time` in its place.
    pub fn observe(&self, hash: u64, time: i64) -> Option<i64> {
        let mut previous = None;
        self.cache.entry(hash).and_compute_with(|entry| {
            previous = entry.map(|e| e.into_value());
            Op::Put(time)
        });

        let metric_def = if previous.is_some() {
            DEDUP_CACHE_HIT
        } else {
            DEDUP_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        previous
    }

    /// Sets `previous_time` on the impression and records it as seen.
    pub fn test_and_set(&self, impression: &mut Impression) {
        impression.previous_time = self.observe(impression_hash(impression), impression.time);
    }

    #[cfg(test)]
    fn sync(&self) {
        self.cache.run_pending_tasks();
    }

    #[cfg(test)]
    fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for ImpressionObserver {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Hash over every field that makes two impressions "the same", i.e. all but the time.
pub fn impression_hash(impression: &Impression) -> u64 {
    let mut hasher = SipHasher13::new();
    impression.key.hash(&mut hasher);
    impression.bucketing_key.hash(&mut hasher);
    impression.feature.hash(&mut hasher);
    impression.treatment.hash(&mut hasher);
    impression.label.hash(&mut hasher);
    impression.change_number.hash(&mut hasher);
    hasher.finish()
}
