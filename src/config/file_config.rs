use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub logging_level: Option<String>,

    // Feature configs
    pub scheduler: Option<SchedulerConfig>,
    pub notifications: Option<NotificationsConfig>,
    pub providers: Option<ProvidersConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: Option<u64>,
    pub max_concurrent_jobs: Option<usize>,
    pub default_timeout_secs: Option<u64>,
    pub default_timezone: Option<String>,
    pub seed_default_jobs: Option<bool>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct NotificationsConfig {
    pub dedup_window_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_initial_backoff_secs: Option<u64>,
    pub retry_max_backoff_secs: Option<u64>,
    pub retry_backoff_multiplier: Option<f64>,
    pub stale_processing_secs: Option<u64>,
    pub default_batch_size: Option<u32>,
    pub log_retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProvidersConfig {
    pub email: Option<ProviderConfig>,
    pub sms: Option<ProviderConfig>,
    pub push: Option<ProviderConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    /// When absent the channel uses the log-only provider.
    pub webhook_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
