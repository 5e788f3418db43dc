use crate::counter::epoch_millis;
use crate::metrics_defs::{IMPRESSIONS_STATS, SYNC_LAST_SUCCESS, SYNC_LATENCY};
use shared::{counter, gauge, histogram};
use std::time::{Duration, SystemTime};

/// The kinds of data the agent synchronizes upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ImpressionSync,
    ImpressionCountSync,
}

impl ResourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ImpressionSync => "impression_sync",
            ResourceKind::ImpressionCountSync => "impression_count_sync",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImpressionsStatKind {
    /// Impressions accepted into the local queue.
    Queued,
    /// Impressions rejected by a full queue.
    Dropped,
    /// Impressions held back from the recorder because an identical one was already sent.
    Deduped,
}

impl ImpressionsStatKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ImpressionsStatKind::Queued => "queued",
            ImpressionsStatKind::Dropped => "dropped",
            ImpressionsStatKind::Deduped => "deduped",
        }
    }
}

/// Sink for operational telemetry about synchronization.
pub trait TelemetryRecorder: Send + Sync {
    fn record_sync_latency(&self, resource: ResourceKind, latency: Duration);

    fn record_successful_sync(&self, resource: ResourceKind, when: SystemTime);

    fn record_impressions_stats(&self, kind: ImpressionsStatKind, count: u64);
}

/// Publishes telemetry through the `metrics` facade.
#[derive(Clone, Default)]
pub struct MetricsTelemetry;

impl TelemetryRecorder for MetricsTelemetry {
    fn record_sync_latency(&self, resource: ResourceKind, latency: Duration) {
        histogram!(SYNC_LATENCY, "resource" => resource.as_str()).record(latency.as_secs_f64());
    }

    fn record_successful_sync(&self, resource: ResourceKind, when: SystemTime) {
        gauge!(SYNC_LAST_SUCCESS, "resource" => resource.as_str()).set(epoch_millis(when) as f64);
    }

    fn record_impressions_stats(&self, kind: ImpressionsStatKind, count: u64) {
        counter!(IMPRESSIONS_STATS, "kind" => kind.as_str()).increment(count);
    }
}
