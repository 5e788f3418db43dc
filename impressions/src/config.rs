use crate::governor::{AdaptiveGovernor, FixedLimit, Governor, Unlimited};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImpressionsMode {
    Debug,
    #[default]
    Optimized,
}

impl ImpressionsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpressionsMode::Debug => "debug",
            ImpressionsMode::Optimized => "optimized",
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum GovernorConfig {
    Unlimited,
    Fixed {
        permits: usize,
    },
    Adaptive {
        min_permits: usize,
        max_permits: usize,
        window: usize,
    },
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig::Adaptive {
            min_permits: 1,
            max_permits: 4,
            window: 20,
        }
    }
}

impl GovernorConfig {
    pub fn build(&self, batch_size: usize) -> Arc<dyn Governor> {
        match *self {
            GovernorConfig::Unlimited => Arc::new(Unlimited),
            GovernorConfig::Fixed { permits } => Arc::new(FixedLimit::new(permits)),
            GovernorConfig::Adaptive {
                min_permits,
                max_permits,
                window,
            } => Arc::new(AdaptiveGovernor::new(
                min_permits,
                max_permits,
                window,
                batch_size,
            )),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ListenerConfig {
    pub endpoint: Url,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub api_key: String,
    pub events_url: Url,
    #[serde(default)]
    pub impressions_mode: ImpressionsMode,
    #[serde(default = "default_post_rate_secs")]
    pub post_rate_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_dedup_cache_size")]
    pub dedup_cache_size: u64,
    #[serde(default = "default_count_post_rate_secs")]
    pub count_post_rate_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    pub listener: Option<ListenerConfig>,
    #[serde(default)]
    pub governor: GovernorConfig,
}

fn default_post_rate_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    5000
}

fn default_dedup_cache_size() -> u64 {
    500_000
}

fn default_count_post_rate_secs() -> u64 {
    1800
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    100_000
}

impl Config {
    pub fn post_rate(&self) -> Duration {
        Duration::from_secs(self.post_rate_secs)
    }

    pub fn count_post_rate(&self) -> Duration {
        Duration::from_secs(self.count_post_rate_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::ZeroBatchSize);
        }
        if self.dedup_cache_size == 0 {
            return Err(ValidationError::ZeroCacheSize);
        }
        if self.post_rate_secs == 0 || self.count_post_rate_secs == 0 {
            return Err(ValidationError::ZeroRate);
        }
        match self.governor {
            GovernorConfig::Fixed { permits: 0 } => return Err(ValidationError::ZeroPermits),
            GovernorConfig::Adaptive {
                min_permits,
                max_permits,
                ..
            } => {
                if min_permits == 0 {
                    return Err(ValidationError::ZeroPermits);
                }
                if min_permits > max_permits {
                    return Err(ValidationError::InvalidPermitRange {
                        min: min_permits,
                        max: max_permits,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,
    #[error("dedup_cache_size must be greater than zero")]
    ZeroCacheSize,
    #[error("post rates must be greater than zero")]
    ZeroRate,
    #[error("governor permits must be greater than zero")]
    ZeroPermits,
    #[error("governor min_permits {min} exceeds max_permits {max}")]
    InvalidPermitRange { min: usize, max: usize },
}
