use serde::{Deserialize, Serialize};

/// Identifies the SDK instance that produced a batch of impressions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub machine_ip: String,
    pub machine_name: String,
    pub sdk_version: String,
}

impl Identity {
    pub fn new<I, N, V>(machine_ip: I, machine_name: N, sdk_version: V) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        V: Into<String>,
    {
        Identity {
            machine_ip: machine_ip.into(),
            machine_name: machine_name.into(),
            sdk_version: sdk_version.into(),
        }
    }
}

/// A single flag evaluation reported by an SDK.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Impression {
    pub feature: String,
    pub key: String,
    pub bucketing_key: Option<String>,
    pub treatment: String,
    pub label: String,
    pub change_number: i64,
    /// Epoch milliseconds.
    pub time: i64,
    /// Time an identical impression was last observed. Filled in by the
    /// [`ImpressionObserver`](crate::observer::ImpressionObserver).
    pub previous_time: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedImpression {
    pub impression: Impression,
    pub identity: Identity,
}

/// All impressions for one feature, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureImpressions {
    pub feature: String,
    pub impressions: Vec<Impression>,
}

/// The unit sent to a destination: one identity and its per-feature impressions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImpressionsForDestination {
    pub identity: Identity,
    pub features: Vec<FeatureImpressions>,
}

impl ImpressionsForDestination {
    pub fn len(&self) -> usize {
        self.features.iter().map(|f| f.impressions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The tuple the duplicate counter aggregates on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub feature: String,
    pub key: String,
    pub bucketing_key: Option<String>,
    pub treatment: String,
}

impl From<&Impression> for CounterKey {
    fn from(impression: &Impression) -> Self {
        CounterKey {
            feature: impression.feature.clone(),
            key: impression.key.clone(),
            bucketing_key: impression.bucketing_key.clone(),
            treatment: impression.treatment.clone(),
        }
    }
}
