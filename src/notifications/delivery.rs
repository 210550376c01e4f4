//! Drains the notification queue for one channel and hands entries to the
//! channel provider.

use super::directory::UserDirectory;
use super::models::{Channel, NotificationLogEntry, NotificationQueueEntry, NotificationTrigger, Priority, QueueStatus};
use super::providers::{ChannelProviders, DecryptionError, PiiDecryptor, ProviderError};
use super::render::{render_message, RenderedMessage};
use super::retry_policy::RetryPolicy;
use super::store::NotificationStore;
use crate::server::metrics;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no {channel} contact for user {username}")]
    MissingRecipient { username: String, channel: &'static str },
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub max_attempts: u32,
    /// When set, every entry goes to this address instead of the user's.
    pub test_recipient: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed entries left in processing because the run was cancelled.
    pub abandoned: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestDeliveryReport {
    pub channel: Channel,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// One synthetic message for admin verification. Never written to the queue.
#[derive(Debug, Clone)]
pub struct TestMessage {
    pub username: String,
    pub trigger: NotificationTrigger,
    pub channel: Channel,
    pub template_data: JsonValue,
    pub recipient_override: Option<String>,
}

pub struct DeliveryPipeline {
    store: Arc<dyn NotificationStore>,
    directory: Arc<dyn UserDirectory>,
    providers: ChannelProviders,
    decryptor: Arc<dyn PiiDecryptor>,
    retry_policy: RetryPolicy,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        directory: Arc<dyn UserDirectory>,
        providers: ChannelProviders,
        decryptor: Arc<dyn PiiDecryptor>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            providers,
            decryptor,
            retry_policy,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Claims up to `batch_size` due entries of `channel` and attempts each
    /// one. `is_cancelled` is checked between entries; entries not reached are
    /// left in processing for reconciliation.
    pub fn run_batch(
        &self,
        channel: Channel,
        options: &BatchOptions,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<BatchReport> {
        let claimed = self
            .store
            .claim_pending(channel, Utc::now(), options.batch_size)
            .with_context(|| format!("Failed to claim {} entries", channel.as_str()))?;
        metrics::record_queue_claims(channel.as_str(), claimed.len());

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            debug!("No due {} notifications", channel.as_str());
            return Ok(report);
        }

        let policy = self.retry_policy.with_max_attempts(options.max_attempts);
        for (i, entry) in claimed.iter().enumerate() {
            if is_cancelled() {
                report.abandoned = claimed.len() - i;
                warn!(
                    "{} delivery cancelled, {} claimed entries left for reconciliation",
                    channel.as_str(),
                    report.abandoned
                );
                break;
            }
            match self.process_entry(entry, &policy, options.test_recipient.as_deref()) {
                Ok(QueueStatus::Sent) => report.sent += 1,
                Ok(QueueStatus::Pending) => report.retried += 1,
                Ok(_) => report.failed += 1,
                Err(e) => report.errors.push(format!("entry {}: {:#}", entry.id, e)),
            }
        }

        info!(
            "{} delivery: claimed={} sent={} retried={} failed={}",
            channel.as_str(),
            report.claimed,
            report.sent,
            report.retried,
            report.failed
        );
        Ok(report)
    }

    /// Delivers one claimed entry and records the outcome. Returns the status
    /// the entry ended in.
    fn process_entry(
        &self,
        entry: &NotificationQueueEntry,
        policy: &RetryPolicy,
        test_recipient: Option<&str>,
    ) -> Result<QueueStatus> {
        let metadata = json!({
            "entryId": entry.id,
            "username": entry.username,
            "trigger": entry.trigger,
            "priority": entry.priority,
        });
        let outcome = self.deliver(
            &entry.username,
            entry.trigger,
            entry.channel,
            &entry.template_data,
            test_recipient,
            &metadata,
        );

        let now = Utc::now();
        let (status, message, error) = match outcome {
            Ok((_, message)) => {
                self.store.mark_sent(entry.id, now)?;
                (QueueStatus::Sent, Some(message), None)
            }
            Err((message, e)) => {
                let attempts = entry.attempts + 1;
                let error = e.to_string();
                let status = self
                    .store
                    .record_failed_attempt(
                        entry.id,
                        &error,
                        policy.max_attempts,
                        policy.next_retry_at(attempts, now),
                    )?
                    .unwrap_or(QueueStatus::Failed);
                warn!(
                    "Delivery of entry {} ({} to {}) failed on attempt {}/{}: {}",
                    entry.id,
                    entry.channel.as_str(),
                    entry.username,
                    attempts,
                    policy.max_attempts,
                    error
                );
                (status, message, Some(error))
            }
        };

        let result = match status {
            QueueStatus::Sent => "sent",
            QueueStatus::Pending => "retry",
            _ => "failed",
        };
        metrics::record_delivery(entry.channel.as_str(), result);
        self.append_log(
            Some(entry.id),
            &entry.username,
            entry.trigger,
            entry.channel,
            entry.priority,
            result,
            message.as_ref(),
            error,
            test_recipient.is_some(),
        );
        Ok(status)
    }

    /// Resolves the recipient, renders and sends. On failure the rendered
    /// message is returned too when rendering got that far.
    fn deliver(
        &self,
        username: &str,
        trigger: NotificationTrigger,
        channel: Channel,
        data: &JsonValue,
        recipient_override: Option<&str>,
        metadata: &JsonValue,
    ) -> Result<(String, RenderedMessage), (Option<RenderedMessage>, DeliveryError)> {
        let recipient = self
            .resolve_recipient(username, channel, recipient_override)
            .map_err(|e| (None, e))?;
        let template = self
            .store
            .get_active_template(trigger, channel)
            .map_err(|e| (None, DeliveryError::Storage(e.to_string())))?;
        let message = render_message(template.as_ref(), trigger, channel, data);
        match self.providers.for_channel(channel).send(
            &recipient,
            &message.subject,
            &message.body,
            metadata,
        ) {
            Ok(()) => Ok((recipient, message)),
            Err(e) => Err((Some(message), e.into())),
        }
    }

    fn resolve_recipient(
        &self,
        username: &str,
        channel: Channel,
        recipient_override: Option<&str>,
    ) -> Result<String, DeliveryError> {
        if let Some(recipient) = recipient_override {
            return Ok(recipient.to_string());
        }
        let profile = self
            .directory
            .get_profile(username)
            .map_err(|e| DeliveryError::Storage(e.to_string()))?;
        let raw = profile
            .as_ref()
            .and_then(|p| p.contact_for(channel))
            .ok_or_else(|| DeliveryError::MissingRecipient {
                username: username.to_string(),
                channel: channel.as_str(),
            })?;
        Ok(self.decryptor.decrypt(raw)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn append_log(
        &self,
        queue_entry_id: Option<i64>,
        username: &str,
        trigger: NotificationTrigger,
        channel: Channel,
        priority: Priority,
        status: &str,
        message: Option<&RenderedMessage>,
        error: Option<String>,
        is_test: bool,
    ) {
        let log_entry = NotificationLogEntry {
            id: 0,
            queue_entry_id,
            username: username.to_string(),
            trigger,
            channel,
            priority,
            status: status.to_string(),
            subject: message.map(|m| m.subject.clone()),
            preview: message.map(|m| m.preview()),
            error,
            is_test,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&log_entry) {
            warn!("Failed to append notification log for {}: {}", username, e);
        }
    }

    /// Sends one synthetic message synchronously. Queue and schedule state are
    /// untouched; the attempt is logged with `is_test`.
    pub fn send_test(&self, message: &TestMessage) -> TestDeliveryReport {
        let metadata = json!({
            "username": message.username,
            "trigger": message.trigger,
            "test": true,
        });
        let outcome = self.deliver(
            &message.username,
            message.trigger,
            message.channel,
            &message.template_data,
            message.recipient_override.as_deref(),
            &metadata,
        );
        let (report, rendered, error) = match outcome {
            Ok((recipient, rendered)) => (
                TestDeliveryReport {
                    channel: message.channel,
                    recipient: Some(recipient),
                    subject: Some(rendered.subject.clone()),
                    success: true,
                    error: None,
                },
                Some(rendered),
                None,
            ),
            Err((rendered, e)) => (
                TestDeliveryReport {
                    channel: message.channel,
                    recipient: message.recipient_override.clone(),
                    subject: rendered.as_ref().map(|r| r.subject.clone()),
                    success: false,
                    error: Some(e.to_string()),
                },
                rendered,
                Some(e.to_string()),
            ),
        };
        self.append_log(
            None,
            &message.username,
            message.trigger,
            message.channel,
            Priority::High,
            if report.success { "sent" } else { "failed" },
            rendered.as_ref(),
            error,
            true,
        );
        report
    }
}
