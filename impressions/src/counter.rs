//! Windowed occurrence counts for optimized mode.
//!
//! The counter never resets itself. Whoever owns the flush cadence calls
//! [`ImpressionsCounter::pop_all`], which hands back the current window and
//! starts a new one.

use crate::protocol::{ImpressionCountDto, ImpressionCountsDto};
use crate::types::CounterKey;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

const HOUR_MS: i64 = 60 * 60 * 1000;

struct Window {
    started_at: SystemTime,
    counts: HashMap<CounterKey, u64>,
}

impl Window {
    fn new() -> Self {
        Window {
            started_at: SystemTime::now(),
            counts: HashMap::new(),
        }
    }
}

pub struct ImpressionsCounter {
    window: Mutex<Window>,
}

impl ImpressionsCounter {
    pub fn new() -> Self {
        ImpressionsCounter {
            window: Mutex::new(Window::new()),
        }
    }

    pub fn inc(&self, feature: &str, key: &str, bucketing_key: Option<&str>, treatment: &str) {
        let counter_key = CounterKey {
            feature: feature.to_string(),
            key: key.to_string(),
            bucketing_key: bucketing_key.map(str::to_string),
            treatment: treatment.to_string(),
        };
        *self.window.lock().counts.entry(counter_key).or_insert(0) += 1;
    }

    /// Count accumulated for `key` in the current window.
    pub fn get(&self, key: &CounterKey) -> u64 {
        self.window.lock().counts.get(key).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.window.lock().counts.is_empty()
    }

    /// Takes the current window, leaving an empty one behind.
    pub fn pop_all(&self) -> CounterSnapshot {
        let window = std::mem::replace(&mut *self.window.lock(), Window::new());
        CounterSnapshot {
            window_start: window.started_at,
            counts: window.counts,
        }
    }
}

impl Default for ImpressionsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct CounterSnapshot {
    pub window_start: SystemTime,
    pub counts: HashMap<CounterKey, u64>,
}

impl CounterSnapshot {
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Aggregates the window per feature, stamped with the hour the window started in.
    pub fn to_payload(&self) -> ImpressionCountsDto {
        let time_frame = truncate_to_hour(epoch_millis(self.window_start));

        let mut per_feature: IndexMap<&str, u64> = IndexMap::new();
        for (key, count) in &self.counts {
            *per_feature.entry(key.feature.as_str()).or_insert(0) += count;
        }
        per_feature.sort_keys();

        ImpressionCountsDto {
            per_feature: per_feature
                .into_iter()
                .map(|(feature, raw_count)| ImpressionCountDto {
                    feature: feature.to_string(),
                    time_frame,
                    raw_count,
                })
                .collect(),
        }
    }
}

pub(crate) fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn truncate_to_hour(millis: i64) -> i64 {
    millis - millis.rem_euclid(HOUR_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(feature: &str, key: &str) -> CounterKey {
        CounterKey {
            feature: feature.into(),
            key: key.into(),
            bucketing_key: None,
            treatment: "on".into(),
        }
    }

    #[test]
    fn test_inc_and_get() {
        let counter = ImpressionsCounter::new();
        assert!(counter.is_empty());

        counter.inc("feature1", "k1", None, "on");
        counter.inc("feature1", "k1", None, "on");
        counter.inc("feature1", "k2", None, "on");
        counter.inc("feature1", "k1", Some("b"), "on");

        assert_eq!(counter.get(&key("feature1", "k1")), 2);
        assert_eq!(counter.get(&key("feature1", "k2")), 1);
        assert_eq!(counter.get(&key("feature2", "k1")), 0);
        assert!(!counter.is_empty());
    }

    #[test]
    fn test_pop_all_starts_new_window() {
        let counter = ImpressionsCounter::new();
        counter.inc("feature1", "k1", None, "on");
        counter.inc("feature1", "k1", None, "on");

        let snapshot = counter.pop_all();
        assert_eq!(snapshot.total(), 2);
        assert!(counter.is_empty());
        assert_eq!(counter.get(&key("feature1", "k1")), 0);

        assert!(counter.pop_all().is_empty());
    }

    #[test]
    fn test_payload_aggregates_per_feature() {
        let mut counts = HashMap::new();
        counts.insert(key("feature2", "k1"), 3);
        counts.insert(key("feature1", "k1"), 1);
        counts.insert(key("feature1", "k2"), 4);

        let snapshot = CounterSnapshot {
            window_start: UNIX_EPOCH + Duration::from_millis(2 * HOUR_MS as u64 + 1234),
            counts,
        };

        let payload = snapshot.to_payload();
        assert_eq!(
            payload.per_feature,
            vec![
                ImpressionCountDto {
                    feature: "feature1".into(),
                    time_frame: 2 * HOUR_MS,
                    raw_count: 5,
                },
                ImpressionCountDto {
                    feature: "feature2".into(),
                    time_frame: 2 * HOUR_MS,
                    raw_count: 3,
                },
            ]
        );
    }

    #[test]
    fn test_concurrent_inc() {
        let counter = Arc::new(ImpressionsCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        counter.inc("feature1", "k1", None, "on");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(&key("feature1", "k1")), 1000);
    }
}
