//! Splits a popped batch by originating SDK instance and by feature.
//!
//! Both levels preserve first-seen order: groups appear in the order their
//! first impression was popped and impressions keep their relative order
//! within a group.

use crate::types::{FeatureImpressions, Identity, Impression, QueuedImpression};
use indexmap::IndexMap;

pub fn group_by_identity(queued: Vec<QueuedImpression>) -> IndexMap<Identity, Vec<Impression>> {
    let mut groups: IndexMap<Identity, Vec<Impression>> = IndexMap::new();
    for QueuedImpression {
        impression,
        identity,
    } in queued
    {
        groups.entry(identity).or_default().push(impression);
    }
    groups
}

pub fn partition_by_feature(impressions: Vec<Impression>) -> Vec<FeatureImpressions> {
    let mut features: IndexMap<String, Vec<Impression>> = IndexMap::new();
    for impression in impressions {
        // Avoid cloning the feature name for every impression of an already seen feature
        match features.get_mut(impression.feature.as_str()) {
            Some(list) => list.push(impression),
            None => {
                features.insert(impression.feature.clone(), vec![impression]);
            }
        }
    }

    features
        .into_iter()
        .map(|(feature, impressions)| FeatureImpressions {
            feature,
            impressions,
        })
        .collect()
}
