pub mod config;
pub mod counter;
pub mod errors;
pub mod governor;
pub mod grouper;
pub mod listener;
pub mod metrics_defs;
pub mod observer;
pub mod protocol;
pub mod queue;
pub mod recorder;
pub mod status;
pub mod synchronizer;
pub mod task;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::config::{Config, ImpressionsMode};
use crate::counter::ImpressionsCounter;
use crate::errors::BuildError;
use crate::listener::{HttpImpressionListener, ImpressionListener};
use crate::observer::ImpressionObserver;
use crate::queue::InMemoryQueue;
use crate::recorder::HttpImpressionRecorder;
use crate::synchronizer::{Deduplication, ImpressionSynchronizer};
use crate::task::{CountFlusher, SyncTask};
use crate::telemetry::{MetricsTelemetry, TelemetryRecorder};
use std::sync::Arc;

/// Everything needed to run impression sync, not yet started.
pub struct Impressions {
    /// Where SDK-facing ingestion pushes impressions.
    pub queue: Arc<InMemoryQueue>,
    pub task: SyncTask,
}

/// Wires the sync engine and its collaborators from config.
pub fn build(config: &Config) -> Result<Impressions, BuildError> {
    config.validate()?;

    let telemetry: Arc<dyn TelemetryRecorder> = Arc::new(MetricsTelemetry);
    let queue = Arc::new(InMemoryQueue::new(config.queue_capacity, telemetry.clone()));
    let recorder = Arc::new(HttpImpressionRecorder::new(
        &config.events_url,
        config.api_key.clone(),
        config.http_timeout(),
    )?);
    let observer = Arc::new(ImpressionObserver::new(config.dedup_cache_size));
    let governor = config.governor.build(config.batch_size);

    let (deduplication, count_flusher) = match config.impressions_mode {
        ImpressionsMode::Debug => (Deduplication::Debug, None),
        ImpressionsMode::Optimized => {
            let counter = Arc::new(ImpressionsCounter::new());
            let flusher = CountFlusher::new(counter.clone(), recorder.clone(), telemetry.clone());
            (Deduplication::Optimized(counter), Some(flusher))
        }
    };

    let synchronizer = match &config.listener {
        Some(listener_config) => {
            let listener: Arc<dyn ImpressionListener> = Arc::new(HttpImpressionListener::new(
                listener_config.endpoint.clone(),
                config.http_timeout(),
            )?);
            ImpressionSynchronizer::with_listener(
                queue.clone(),
                recorder,
                listener,
                telemetry,
                observer,
                deduplication,
                governor,
            )
        }
        None => ImpressionSynchronizer::new(
            queue.clone(),
            recorder,
            telemetry,
            observer,
            deduplication,
            governor,
        ),
    };

    let task = SyncTask::new(
        synchronizer,
        count_flusher,
        config.batch_size,
        config.post_rate(),
        config.count_post_rate(),
    );

    Ok(Impressions { queue, task })
}
