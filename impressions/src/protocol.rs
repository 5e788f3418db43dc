//! Wire formats for the events backend and the impression listener.

use crate::types::{FeatureImpressions, Identity, Impression, ImpressionsForDestination};
use serde::{Deserialize, Serialize};

/// Impressions for one feature, as posted to the bulk endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpressionsDto {
    #[serde(rename = "f")]
    pub feature: String,
    #[serde(rename = "i")]
    pub key_impressions: Vec<KeyImpressionDto>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyImpressionDto {
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    #[serde(rename = "t")]
    pub treatment: String,
    #[serde(rename = "r")]
    pub label: String,
    #[serde(rename = "c")]
    pub change_number: i64,
    #[serde(rename = "m")]
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pt: Option<i64>,
}

impl From<&Impression> for KeyImpressionDto {
    fn from(impression: &Impression) -> Self {
        KeyImpressionDto {
            key: impression.key.clone(),
            bucketing_key: impression.bucketing_key.clone(),
            treatment: impression.treatment.clone(),
            label: impression.label.clone(),
            change_number: impression.change_number,
            time: impression.time,
            pt: impression.previous_time.filter(|pt| *pt != 0),
        }
    }
}

impl From<&FeatureImpressions> for ImpressionsDto {
    fn from(group: &FeatureImpressions) -> Self {
        ImpressionsDto {
            feature: group.feature.clone(),
            key_impressions: group.impressions.iter().map(KeyImpressionDto::from).collect(),
        }
    }
}

pub fn to_bulk_payload(destination: &ImpressionsForDestination) -> Vec<ImpressionsDto> {
    destination.features.iter().map(ImpressionsDto::from).collect()
}

/// Size in bytes of the bulk payload for `destination`.
pub fn encoded_len(destination: &ImpressionsForDestination) -> usize {
    match serde_json::to_vec(&to_bulk_payload(destination)) {
        Ok(bytes) => bytes.len(),
        Err(e) => {
            tracing::warn!(error = %e, "could not size impressions payload");
            0
        }
    }
}

/// Body posted to a user supplied impression listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListenerPayload {
    pub impressions: Vec<ListenerImpressionsDto>,
    #[serde(rename = "sdkVersion")]
    pub sdk_version: String,
    #[serde(rename = "machineIP")]
    pub machine_ip: String,
    #[serde(rename = "machineName")]
    pub machine_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerImpressionsDto {
    pub test_name: String,
    pub key_impressions: Vec<ListenerKeyImpressionDto>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerKeyImpressionDto {
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    pub treatment: String,
    pub label: String,
    pub change_number: i64,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pt: Option<i64>,
}

impl ListenerPayload {
    pub fn new(destination: &ImpressionsForDestination) -> Self {
        let Identity {
            machine_ip,
            machine_name,
            sdk_version,
        } = destination.identity.clone();

        let impressions = destination
            .features
            .iter()
            .map(|group| ListenerImpressionsDto {
                test_name: group.feature.clone(),
                key_impressions: group
                    .impressions
                    .iter()
                    .map(|i| ListenerKeyImpressionDto {
                        key_name: i.key.clone(),
                        bucketing_key: i.bucketing_key.clone(),
                        treatment: i.treatment.clone(),
                        label: i.label.clone(),
                        change_number: i.change_number,
                        time: i.time,
                        pt: i.previous_time.filter(|pt| *pt != 0),
                    })
                    .collect(),
            })
            .collect();

        ListenerPayload {
            impressions,
            sdk_version,
            machine_ip,
            machine_name,
        }
    }
}

/// Per-feature impression counts for one time frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpressionCountDto {
    #[serde(rename = "f")]
    pub feature: String,
    /// Start of the hour the counts belong to, in epoch milliseconds.
    #[serde(rename = "m")]
    pub time_frame: i64,
    #[serde(rename = "rc")]
    pub raw_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpressionCountsDto {
    #[serde(rename = "pf")]
    pub per_feature: Vec<ImpressionCountDto>,
}
