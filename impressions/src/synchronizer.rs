//! One synchronization pass: pop, group, deduplicate, forward, report.
//!
//! Each identity group is forwarded in its own task. A failing or slow group
//! never holds back the others; its failure is only folded into the error
//! returned once every group has finished.

use crate::config::ImpressionsMode;
use crate::counter::ImpressionsCounter;
use crate::errors::{GroupError, GroupFailure, RecorderError, SyncError};
use crate::governor::{Governor, Permit};
use crate::grouper::{group_by_identity, partition_by_feature};
use crate::listener::ImpressionListener;
use crate::metrics_defs::{GOVERNOR_REFUSED, SYNC_PASSES};
use crate::observer::ImpressionObserver;
use crate::protocol::encoded_len;
use crate::queue::ImpressionQueue;
use crate::recorder::{IMPRESSIONS_MODE_HEADER, ImpressionRecorder};
use crate::telemetry::{ImpressionsStatKind, ResourceKind, TelemetryRecorder};
use crate::types::{
    CounterKey, FeatureImpressions, Identity, Impression, ImpressionsForDestination,
    QueuedImpression,
};
use shared::counter;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::task::JoinSet;

/// How repeated impressions are treated on the way to the recorder.
#[derive(Clone)]
pub enum Deduplication {
    /// Every impression is forwarded.
    Debug,
    /// Identical impressions within a group collapse to the first one; all
    /// occurrences are counted.
    Optimized(Arc<ImpressionsCounter>),
}

impl Deduplication {
    pub fn mode(&self) -> ImpressionsMode {
        match self {
            Deduplication::Debug => ImpressionsMode::Debug,
            Deduplication::Optimized(_) => ImpressionsMode::Optimized,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// The governor refused a permit; nothing was touched.
    Skipped,
    Completed,
}

struct Inner {
    queue: Arc<dyn ImpressionQueue>,
    recorder: Arc<dyn ImpressionRecorder>,
    listener: Option<Arc<dyn ImpressionListener>>,
    telemetry: Arc<dyn TelemetryRecorder>,
    observer: Arc<ImpressionObserver>,
    deduplication: Deduplication,
    governor: Arc<dyn Governor>,
    extra_headers: HashMap<String, String>,
}

#[derive(Clone)]
pub struct ImpressionSynchronizer {
    inner: Arc<Inner>,
}

impl ImpressionSynchronizer {
    pub fn new(
        queue: Arc<dyn ImpressionQueue>,
        recorder: Arc<dyn ImpressionRecorder>,
        telemetry: Arc<dyn TelemetryRecorder>,
        observer: Arc<ImpressionObserver>,
        deduplication: Deduplication,
        governor: Arc<dyn Governor>,
    ) -> Self {
        Self::build(
            queue,
            recorder,
            None,
            telemetry,
            observer,
            deduplication,
            governor,
        )
    }

    /// Same as [`ImpressionSynchronizer::new`], also forwarding every raw
    /// impression to `listener`.
    pub fn with_listener(
        queue: Arc<dyn ImpressionQueue>,
        recorder: Arc<dyn ImpressionRecorder>,
        listener: Arc<dyn ImpressionListener>,
        telemetry: Arc<dyn TelemetryRecorder>,
        observer: Arc<ImpressionObserver>,
        deduplication: Deduplication,
        governor: Arc<dyn Governor>,
    ) -> Self {
        Self::build(
            queue,
            recorder,
            Some(listener),
            telemetry,
            observer,
            deduplication,
            governor,
        )
    }

    fn build(
        queue: Arc<dyn ImpressionQueue>,
        recorder: Arc<dyn ImpressionRecorder>,
        listener: Option<Arc<dyn ImpressionListener>>,
        telemetry: Arc<dyn TelemetryRecorder>,
        observer: Arc<ImpressionObserver>,
        deduplication: Deduplication,
        governor: Arc<dyn Governor>,
    ) -> Self {
        let extra_headers = HashMap::from([(
            IMPRESSIONS_MODE_HEADER.to_string(),
            deduplication.mode().as_str().to_string(),
        )]);

        ImpressionSynchronizer {
            inner: Arc::new(Inner {
                queue,
                recorder,
                listener,
                telemetry,
                observer,
                deduplication,
                governor,
                extra_headers,
            }),
        }
    }

    pub fn mode(&self) -> ImpressionsMode {
        self.inner.deduplication.mode()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.governor.busy()
    }

    pub fn queue(&self) -> &Arc<dyn ImpressionQueue> {
        &self.inner.queue
    }

    /// Runs a pass if the governor admits one. The permit is held for the
    /// whole pass and returned on every exit path. The governor learns how
    /// many impressions the pop returned across all identity groups.
    pub async fn try_synchronize(&self, batch_size: usize) -> Result<PassOutcome, SyncError> {
        let Some(_permit) = Permit::try_acquire(&self.inner.governor) else {
            counter!(GOVERNOR_REFUSED).increment(1);
            counter!(SYNC_PASSES, "outcome" => "skipped").increment(1);
            tracing::debug!("governor refused permit, skipping impression sync");
            return Ok(PassOutcome::Skipped);
        };

        let queued = self.pop(batch_size).await?;
        self.inner
            .governor
            .record_pass(SystemTime::now(), queued.len());
        self.forward(queued).await?;
        Ok(PassOutcome::Completed)
    }

    /// Pops up to `batch_size` impressions and forwards them.
    ///
    /// Popped impressions are never re-queued: an error means some of them
    /// were not delivered.
    pub async fn synchronize_impressions(&self, batch_size: usize) -> Result<(), SyncError> {
        let queued = self.pop(batch_size).await?;
        self.forward(queued).await
    }

    async fn pop(&self, batch_size: usize) -> Result<Vec<QueuedImpression>, SyncError> {
        self.inner
            .queue
            .pop_n_with_metadata(batch_size)
            .await
            .map_err(|e| {
                counter!(SYNC_PASSES, "outcome" => "queue_error").increment(1);
                tracing::error!(error = %e, "failed to pop impressions from queue");
                e.into()
            })
    }

    async fn forward(&self, queued: Vec<QueuedImpression>) -> Result<(), SyncError> {
        if queued.is_empty() {
            counter!(SYNC_PASSES, "outcome" => "empty").increment(1);
            tracing::debug!("no impressions to sync");
            return Ok(());
        }

        let popped = queued.len();
        let groups = group_by_identity(queued);
        let total = groups.len();

        let mut join_set = JoinSet::new();
        let mut task_identities = HashMap::new();
        for (identity, impressions) in groups {
            let inner = self.inner.clone();
            let task_identity = identity.clone();
            let abort_handle = join_set.spawn(async move {
                let result = inner.sync_group(&task_identity, impressions).await;
                (task_identity, result)
            });
            task_identities.insert(abort_handle.id(), identity);
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((identity, Err(e))) => failures.push(GroupFailure {
                    identity,
                    error: GroupError::Recorder(e),
                }),
                Err(e) => {
                    tracing::error!(error = %e, "impression group task failed");
                    if let Some(identity) = task_identities.remove(&e.id()) {
                        failures.push(GroupFailure {
                            identity,
                            error: GroupError::Task(e.to_string()),
                        });
                    }
                }
            }
        }

        if failures.is_empty() {
            counter!(SYNC_PASSES, "outcome" => "success").increment(1);
            tracing::debug!(impressions = popped, groups = total, "impressions synced");
            return Ok(());
        }

        counter!(SYNC_PASSES, "outcome" => "failed").increment(1);
        Err(SyncError::Incomplete { total, failures })
    }
}

impl Inner {
    async fn sync_group(
        &self,
        identity: &Identity,
        impressions: Vec<Impression>,
    ) -> Result<(), RecorderError> {
        let mut features = partition_by_feature(impressions);

        // Dedup state advances before the send, whether or not the send succeeds
        for group in &mut features {
            for impression in &mut group.impressions {
                self.observer.test_and_set(impression);
            }
        }

        let raw = ImpressionsForDestination {
            identity: identity.clone(),
            features,
        };

        let (deduped, suppressed) = match &self.deduplication {
            Deduplication::Debug => (None, 0),
            Deduplication::Optimized(counter) => {
                let (kept, suppressed) = suppress_duplicates(&raw.features, counter);
                let deduped = ImpressionsForDestination {
                    identity: identity.clone(),
                    features: kept,
                };
                (Some(deduped), suppressed)
            }
        };
        let to_record = deduped.as_ref().unwrap_or(&raw);

        if let Some(listener) = &self.listener
            && let Err(e) = listener.submit(&raw).await
        {
            tracing::warn!(
                error = %e,
                sdk_version = %identity.sdk_version,
                machine_name = %identity.machine_name,
                "failed to submit impressions to listener"
            );
        }

        let items = to_record.len();
        let bytes = encoded_len(to_record);

        let before = Instant::now();
        let result = self.recorder.record(to_record, &self.extra_headers).await;
        self.telemetry
            .record_sync_latency(ResourceKind::ImpressionSync, before.elapsed());

        match &result {
            Ok(()) => self
                .telemetry
                .record_successful_sync(ResourceKind::ImpressionSync, SystemTime::now()),
            Err(e) => tracing::error!(
                error = %e,
                sdk_version = %identity.sdk_version,
                machine_name = %identity.machine_name,
                machine_ip = %identity.machine_ip,
                impressions = items,
                "failed to record impressions"
            ),
        }

        self.telemetry
            .record_impressions_stats(ImpressionsStatKind::Deduped, suppressed);
        self.governor
            .store_data_flushed(SystemTime::now(), items, bytes);

        result
    }
}

/// Counts every impression and keeps only the first of each
/// (feature, key, bucketing key, treatment) tuple. Returns the kept
/// impressions and how many were dropped.
fn suppress_duplicates(
    features: &[FeatureImpressions],
    counter: &ImpressionsCounter,
) -> (Vec<FeatureImpressions>, u64) {
    let mut seen: HashSet<CounterKey> = HashSet::new();
    let mut suppressed = 0;

    let kept = features
        .iter()
        .map(|group| {
            let impressions = group
                .impressions
                .iter()
                .filter(|impression| {
                    counter.inc(
                        &impression.feature,
                        &impression.key,
                        impression.bucketing_key.as_deref(),
                        &impression.treatment,
                    );
                    if seen.insert(CounterKey::from(*impression)) {
                        true
                    } else {
                        suppressed += 1;
                        false
                    }
                })
                .cloned()
                .collect();

            FeatureImpressions {
                feature: group.feature.clone(),
                impressions,
            }
        })
        .collect();

    (kept, suppressed)
}
