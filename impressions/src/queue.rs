use crate::errors::QueueError;
use crate::telemetry::{ImpressionsStatKind, TelemetryRecorder};
use crate::types::QueuedImpression;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Source of impressions waiting to be forwarded.
///
/// Pops are destructive: an item returned to one caller is never handed to
/// another, even when several passes pop concurrently.
#[async_trait]
pub trait ImpressionQueue: Send + Sync {
    async fn pop_n_with_metadata(&self, n: usize) -> Result<Vec<QueuedImpression>, QueueError>;

    /// Current depth.
    fn count(&self) -> usize;
}

/// Bounded FIFO kept in process memory.
pub struct InMemoryQueue {
    capacity: usize,
    items: Mutex<VecDeque<QueuedImpression>>,
    telemetry: Arc<dyn TelemetryRecorder>,
}

impl InMemoryQueue {
    pub fn new(capacity: usize, telemetry: Arc<dyn TelemetryRecorder>) -> Self {
        InMemoryQueue {
            capacity,
            items: Mutex::new(VecDeque::new()),
            telemetry,
        }
    }

    /// Appends `impressions`, or rejects all of them if they do not fit.
    /// Accepted impressions count as queued, rejected ones as dropped.
    pub fn push(&self, impressions: Vec<QueuedImpression>) -> Result<(), QueueError> {
        let count = impressions.len() as u64;
        let mut items = self.items.lock();
        if items.len() + impressions.len() > self.capacity {
            drop(items);
            tracing::warn!(
                dropped = count,
                capacity = self.capacity,
                "impression queue full, dropping impressions"
            );
            self.telemetry
                .record_impressions_stats(ImpressionsStatKind::Dropped, count);
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        items.extend(impressions);
        drop(items);
        self.telemetry
            .record_impressions_stats(ImpressionsStatKind::Queued, count);
        Ok(())
    }
}

#[async_trait]
impl ImpressionQueue for InMemoryQueue {
    async fn pop_n_with_metadata(&self, n: usize) -> Result<Vec<QueuedImpression>, QueueError> {
        let mut items = self.items.lock();
        let take = n.min(items.len());
        Ok(items.drain(..take).collect())
    }

    fn count(&self) -> usize {
        self.items.lock().len()
    }
}
