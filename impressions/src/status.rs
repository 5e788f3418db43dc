use crate::queue::ImpressionQueue;
use crate::synchronizer::ImpressionSynchronizer;
use crate::task::SyncTaskHandle;
use serde::Serialize;
use shared::admin_service::StatusProvider;
use std::sync::Arc;

#[derive(Serialize, Debug, PartialEq)]
struct SyncStatus {
    running: bool,
    impressions_mode: &'static str,
    queue_depth: usize,
    governor_busy: bool,
}

/// Exposes the sync task's state to the admin endpoints.
pub struct SyncStatusProvider {
    queue: Arc<dyn ImpressionQueue>,
    synchronizer: ImpressionSynchronizer,
    handle: SyncTaskHandle,
}

impl SyncStatusProvider {
    pub fn new(synchronizer: ImpressionSynchronizer, handle: SyncTaskHandle) -> Self {
        SyncStatusProvider {
            queue: synchronizer.queue().clone(),
            synchronizer,
            handle,
        }
    }

    fn snapshot(&self) -> SyncStatus {
        SyncStatus {
            running: self.handle.is_running(),
            impressions_mode: self.synchronizer.mode().as_str(),
            queue_depth: self.queue.count(),
            governor_busy: self.synchronizer.is_busy(),
        }
    }
}

impl StatusProvider for SyncStatusProvider {
    fn is_ready(&self) -> bool {
        self.handle.is_running()
    }

    fn status(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize sync status");
            "{}".to_string()
        })
    }
}
