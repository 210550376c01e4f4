mod file_config;

pub use file_config::{
    FileConfig, NotificationsConfig, ProviderConfig, ProvidersConfig, SchedulerConfig,
};

use crate::background_jobs::resolve_timezone;
use crate::server::RequestsLoggingLevel;
use anyhow::{anyhow, bail, Result};
use chrono_tz::Tz;
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

/// Server options given on the command line. Any of them may be replaced by
/// the TOML file.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub logging_level: RequestsLoggingLevel,

    pub scheduler: SchedulerSettings,
    pub notifications: NotificationsSettings,
    pub providers: ProvidersSettings,
}

impl AppConfig {
    /// Merges the command line with the optional TOML file, the file winning
    /// on every key it sets, and validates the result.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = existing_db_dir(file.db_dir.map(PathBuf::from).or(cli.db_dir.clone()))?;
        let logging_level = match file.logging_level.as_deref() {
            Some(level) => RequestsLoggingLevel::from_str(level, true)
                .map_err(|_| anyhow!("Unknown logging_level '{}'", level))?,
            None => cli.logging_level.clone(),
        };

        let scheduler = SchedulerSettings::from_file(file.scheduler.unwrap_or_default())?;
        let notifications = NotificationsSettings::from_file(file.notifications.unwrap_or_default())?;

        let providers_file = file.providers.unwrap_or_default();
        let providers = ProvidersSettings {
            email: ProviderSettings::from_file(providers_file.email.unwrap_or_default()),
            sms: ProviderSettings::from_file(providers_file.sms.unwrap_or_default()),
            push: ProviderSettings::from_file(providers_file.push.unwrap_or_default()),
        };

        Ok(Self {
            db_dir,
            port: file.port.unwrap_or(cli.port),
            metrics_port: file.metrics_port.unwrap_or(cli.metrics_port),
            logging_level,
            scheduler,
            notifications,
            providers,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }

    pub fn notifications_db_path(&self) -> PathBuf {
        self.db_dir.join("notifications.db")
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
    pub max_concurrent_jobs: usize,
    pub default_timeout_secs: u64,
    pub default_timezone: Tz,
    pub seed_default_jobs: bool,
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            max_concurrent_jobs: 4,
            default_timeout_secs: 300,
            default_timezone: Tz::UTC,
            seed_default_jobs: true,
            shutdown_grace_secs: 30,
        }
    }
}

impl SchedulerSettings {
    fn from_file(file: SchedulerConfig) -> Result<Self> {
        let defaults = Self::default();
        let default_timezone =
            resolve_timezone(file.default_timezone.as_deref(), defaults.default_timezone)?;
        let settings = Self {
            tick_interval_secs: file.tick_interval_secs.unwrap_or(defaults.tick_interval_secs),
            max_concurrent_jobs: file.max_concurrent_jobs.unwrap_or(defaults.max_concurrent_jobs),
            default_timeout_secs: file
                .default_timeout_secs
                .unwrap_or(defaults.default_timeout_secs),
            default_timezone,
            seed_default_jobs: file.seed_default_jobs.unwrap_or(defaults.seed_default_jobs),
            shutdown_grace_secs: file
                .shutdown_grace_secs
                .unwrap_or(defaults.shutdown_grace_secs),
        };
        if settings.tick_interval_secs == 0 {
            bail!("scheduler.tick_interval_secs must be greater than zero");
        }
        if settings.max_concurrent_jobs == 0 {
            bail!("scheduler.max_concurrent_jobs must be greater than zero");
        }
        Ok(settings)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone)]
pub struct NotificationsSettings {
    pub dedup_window_secs: u64,
    pub max_attempts: u32,
    pub retry_initial_backoff_secs: u64,
    pub retry_max_backoff_secs: u64,
    pub retry_backoff_multiplier: f64,
    pub stale_processing_secs: u64,
    pub default_batch_size: u32,
    pub log_retention_days: u32,
}

impl Default for NotificationsSettings {
    fn default() -> Self {
        Self {
            dedup_window_secs: 3600,
            max_attempts: 3,
            retry_initial_backoff_secs: 60,
            retry_max_backoff_secs: 3600,
            retry_backoff_multiplier: 2.0,
            stale_processing_secs: 900,
            default_batch_size: 50,
            log_retention_days: 90,
        }
    }
}

impl NotificationsSettings {
    fn from_file(file: NotificationsConfig) -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            dedup_window_secs: file.dedup_window_secs.unwrap_or(defaults.dedup_window_secs),
            max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts),
            retry_initial_backoff_secs: file
                .retry_initial_backoff_secs
                .unwrap_or(defaults.retry_initial_backoff_secs),
            retry_max_backoff_secs: file
                .retry_max_backoff_secs
                .unwrap_or(defaults.retry_max_backoff_secs),
            retry_backoff_multiplier: file
                .retry_backoff_multiplier
                .unwrap_or(defaults.retry_backoff_multiplier),
            stale_processing_secs: file
                .stale_processing_secs
                .unwrap_or(defaults.stale_processing_secs),
            default_batch_size: file.default_batch_size.unwrap_or(defaults.default_batch_size),
            log_retention_days: file.log_retention_days.unwrap_or(defaults.log_retention_days),
        };
        if !(1..=10).contains(&settings.max_attempts) {
            bail!("notifications.max_attempts must be between 1 and 10");
        }
        if !(1..=500).contains(&settings.default_batch_size) {
            bail!("notifications.default_batch_size must be between 1 and 500");
        }
        if settings.retry_backoff_multiplier < 1.0 {
            bail!("notifications.retry_backoff_multiplier must be at least 1.0");
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

impl ProviderSettings {
    fn from_file(file: ProviderConfig) -> Self {
        Self {
            webhook_url: file.webhook_url.filter(|u| !u.is_empty()),
            timeout_secs: file.timeout_secs.unwrap_or(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvidersSettings {
    pub email: ProviderSettings,
    pub sms: ProviderSettings,
    pub push: ProviderSettings,
}

fn existing_db_dir(db_dir: Option<PathBuf>) -> Result<PathBuf> {
    let Some(db_dir) = db_dir else {
        bail!("No database directory: pass --db-dir or set db_dir in the config file");
    };
    match db_dir.metadata() {
        Ok(meta) if meta.is_dir() => Ok(db_dir),
        Ok(_) => bail!("{:?} is not a directory", db_dir),
        Err(_) => bail!("Database directory {:?} not found", db_dir),
    }
}
