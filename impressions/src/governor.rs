//! Admission control for synchronization passes.
//!
//! A governor decides whether a new pass may start right now. Refusal is not
//! an error: the pass is skipped and the next scheduled tick tries again.

use crate::metrics_defs::{GOVERNOR_CEILING, GOVERNOR_FLUSHED_BYTES};
use parking_lot::Mutex;
use shared::{gauge, histogram};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

pub trait Governor: Send + Sync {
    /// Attempts to take a permit. Returns false if no new pass may start.
    fn acquire(&self) -> bool;

    /// Returns a permit previously obtained with `acquire`.
    fn release(&self);

    /// True while the number of running passes is at the ceiling.
    fn busy(&self) -> bool;

    /// Feedback after every send attempt, successful or not.
    fn store_data_flushed(&self, when: SystemTime, items: usize, bytes: usize);

    /// Feedback once per admitted pass with how many impressions its pop
    /// returned, summed over every identity group.
    fn record_pass(&self, _when: SystemTime, _popped: usize) {}
}

/// Holds a governor permit and gives it back when dropped.
pub struct Permit {
    governor: Arc<dyn Governor>,
}

impl Permit {
    pub fn try_acquire(governor: &Arc<dyn Governor>) -> Option<Permit> {
        if governor.acquire() {
            Some(Permit {
                governor: governor.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.governor.release();
    }
}

/// Admits every pass.
#[derive(Default)]
pub struct Unlimited;

impl Governor for Unlimited {
    fn acquire(&self) -> bool {
        true
    }

    fn release(&self) {}

    fn busy(&self) -> bool {
        false
    }

    fn store_data_flushed(&self, _when: SystemTime, _items: usize, bytes: usize) {
        histogram!(GOVERNOR_FLUSHED_BYTES).record(bytes as f64);
    }
}

/// Admits at most `permits` concurrent passes.
pub struct FixedLimit {
    permits: usize,
    in_flight: AtomicUsize,
}

impl FixedLimit {
    pub fn new(permits: usize) -> Self {
        FixedLimit {
            permits,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Governor for FixedLimit {
    fn acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.permits).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    fn busy(&self) -> bool {
        self.in_flight() >= self.permits
    }

    fn store_data_flushed(&self, _when: SystemTime, _items: usize, bytes: usize) {
        histogram!(GOVERNOR_FLUSHED_BYTES).record(bytes as f64);
    }
}

struct AdaptiveState {
    in_flight: usize,
    ceiling: usize,
    // Impressions popped by each of the most recent passes
    records: VecDeque<usize>,
    last_flush: Option<SystemTime>,
}

/// Scales the number of concurrent passes with how full recent pops were.
///
/// When passes keep popping full batches the queue is filling faster than a
/// single pass drains it, so more passes are admitted. As pops shrink the
/// ceiling falls back towards `min_permits`.
pub struct AdaptiveGovernor {
    min_permits: usize,
    max_permits: usize,
    window: usize,
    batch_size: usize,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveGovernor {
    pub fn new(min_permits: usize, max_permits: usize, window: usize, batch_size: usize) -> Self {
        let min_permits = min_permits.max(1);
        AdaptiveGovernor {
            min_permits,
            max_permits: max_permits.max(min_permits),
            window: window.max(1),
            batch_size: batch_size.max(1),
            state: Mutex::new(AdaptiveState {
                in_flight: 0,
                ceiling: min_permits,
                records: VecDeque::new(),
                last_flush: None,
            }),
        }
    }

    /// Mean fill ratio of the passes in the window, in [0, 1].
    pub fn lambda(&self) -> f64 {
        let state = self.state.lock();
        self.fill(&state.records)
    }

    pub fn ceiling(&self) -> usize {
        self.state.lock().ceiling
    }

    pub fn last_flush(&self) -> Option<SystemTime> {
        self.state.lock().last_flush
    }

    fn fill(&self, records: &VecDeque<usize>) -> f64 {
        if records.is_empty() {
            return 0.0;
        }
        let total: f64 = records
            .iter()
            .map(|items| (*items as f64 / self.batch_size as f64).min(1.0))
            .sum();
        total / records.len() as f64
    }
}

impl Governor for AdaptiveGovernor {
    fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.in_flight >= state.ceiling {
            return false;
        }
        state.in_flight += 1;
        true
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    fn busy(&self) -> bool {
        let state = self.state.lock();
        state.in_flight >= state.ceiling
    }

    fn store_data_flushed(&self, when: SystemTime, _items: usize, bytes: usize) {
        histogram!(GOVERNOR_FLUSHED_BYTES).record(bytes as f64);

        let mut state = self.state.lock();
        state.last_flush = Some(state.last_flush.map_or(when, |last| last.max(when)));
    }

    fn record_pass(&self, _when: SystemTime, popped: usize) {
        let mut state = self.state.lock();
        state.records.push_back(popped);
        while state.records.len() > self.window {
            state.records.pop_front();
        }

        let span = (self.max_permits - self.min_permits) as f64;
        let fill = self.fill(&state.records);
        state.ceiling = self.min_permits + (span * fill).round() as usize;
        gauge!(GOVERNOR_CEILING).set(state.ceiling as f64);
    }
}
