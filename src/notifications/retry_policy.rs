//! Retry policy for failed deliveries.
//!
//! Implements exponential backoff with configurable parameters.

use crate::config::NotificationsSettings;
use chrono::{DateTime, Duration, Utc};

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after which an entry fails permanently.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt, in seconds.
    pub initial_backoff_secs: u64,
    /// Cap for exponential growth, in seconds.
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(config: &NotificationsSettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_secs: config.retry_initial_backoff_secs,
            max_backoff_secs: config.retry_max_backoff_secs,
            backoff_multiplier: config.retry_backoff_multiplier,
        }
    }

    /// Same policy with a different attempt budget, e.g. from job parameters.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    /// Backoff in seconds after `attempts` failed attempts (1-based):
    /// `initial * multiplier^(attempts - 1)`, capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }

    /// When an entry that has failed `attempts` times becomes claimable again.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.backoff_secs(attempts) as i64)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&NotificationsSettings::default())
    }
}
