use impressions::config::{Config as SyncConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Deserialize, Debug)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "flagsync".into()
}

#[derive(Deserialize, Debug)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            sentry_dsn: None,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct AdminListener {
    pub host: String,
    pub port: u16,
}

impl Default for AdminListener {
    fn default() -> Self {
        AdminListener {
            host: "127.0.0.1".into(),
            port: 3001,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub admin_listener: AdminListener,
    pub sync: SyncConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_listener.port == 0 {
            return Err(ConfigError::InvalidAdminPort);
        }
        self.sync.validate()?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("admin_listener.port must be non-zero")]
    InvalidAdminPort,
    #[error("invalid sync config: {0}")]
    SyncError(#[from] ValidationError),
}
