//! Metrics definitions for impression synchronization.

use shared::metrics_defs::{MetricDef, MetricType};

pub const SYNC_LATENCY: MetricDef = MetricDef {
    name: "sync.latency",
    metric_type: MetricType::Histogram,
    description: "Duration of an upstream send in seconds. Tagged with resource.",
};

pub const SYNC_LAST_SUCCESS: MetricDef = MetricDef {
    name: "sync.last_success",
    metric_type: MetricType::Gauge,
    description: "Epoch milliseconds of the last successful send. Tagged with resource.",
};

pub const SYNC_PASSES: MetricDef = MetricDef {
    name: "sync.passes",
    metric_type: MetricType::Counter,
    description: "Synchronization passes. Tagged with outcome.",
};

pub const IMPRESSIONS_STATS: MetricDef = MetricDef {
    name: "impressions.stats",
    metric_type: MetricType::Counter,
    description: "Impression counts. Tagged with kind (queued, dropped, deduped).",
};

pub const DEDUP_CACHE_HIT: MetricDef = MetricDef {
    name: "dedup_cache.hit",
    metric_type: MetricType::Counter,
    description: "Impressions that had been observed before",
};

pub const DEDUP_CACHE_MISS: MetricDef = MetricDef {
    name: "dedup_cache.miss",
    metric_type: MetricType::Counter,
    description: "Impressions observed for the first time",
};

pub const GOVERNOR_REFUSED: MetricDef = MetricDef {
    name: "governor.refused",
    metric_type: MetricType::Counter,
    description: "Passes skipped because no permit was available",
};

pub const GOVERNOR_CEILING: MetricDef = MetricDef {
    name: "governor.ceiling",
    metric_type: MetricType::Gauge,
    description: "Current number of passes the adaptive governor admits",
};

pub const GOVERNOR_FLUSHED_BYTES: MetricDef = MetricDef {
    name: "governor.flushed_bytes",
    metric_type: MetricType::Histogram,
    description: "Payload size of each send reported to the governor",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SYNC_LATENCY,
    SYNC_LAST_SUCCESS,
    SYNC_PASSES,
    IMPRESSIONS_STATS,
    DEDUP_CACHE_HIT,
    DEDUP_CACHE_MISS,
    GOVERNOR_REFUSED,
    GOVERNOR_CEILING,
    GOVERNOR_FLUSHED_BYTES,
];
