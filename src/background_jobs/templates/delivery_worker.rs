//! Delivery worker template.
//!
//! One template per channel. Each run claims a batch of due queue entries
//! for its channel and hands them to the channel provider.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{JobError, JobResult, JobTemplate, ValidationError};
use crate::background_jobs::parameters::{ParameterSchema, ParameterSpec};
use crate::notifications::{BatchOptions, Channel};
use serde_json::{Map, Value as JsonValue};
use tracing::info;

pub const MAX_BATCH_SIZE: i64 = 500;
pub const MAX_ATTEMPTS_LIMIT: i64 = 10;

pub struct DeliveryWorkerTemplate {
    channel: Channel,
    default_batch_size: u32,
    default_max_attempts: u32,
}

impl DeliveryWorkerTemplate {
    pub fn new(channel: Channel, default_batch_size: u32, default_max_attempts: u32) -> Self {
        Self {
            channel,
            default_batch_size,
            default_max_attempts,
        }
    }

    /// Registry key for the worker of `channel`.
    pub fn template_type_for(channel: Channel) -> &'static str {
        match channel {
            Channel::Email => "email_notifier",
            Channel::Sms => "sms_notifier",
            Channel::Push => "push_notifier",
        }
    }

    fn options(&self, params: &Map<String, JsonValue>) -> BatchOptions {
        let batch_size = params
            .get("batchSize")
            .and_then(JsonValue::as_u64)
            .unwrap_or(self.default_batch_size as u64);
        let max_attempts = params
            .get("maxAttempts")
            .and_then(JsonValue::as_u64)
            .unwrap_or(self.default_max_attempts as u64);
        let test_mode = params
            .get("testMode")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        BatchOptions {
            batch_size: batch_size as usize,
            max_attempts: max_attempts as u32,
            test_recipient: if test_mode {
                params
                    .get("testRecipient")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
            } else {
                None
            },
        }
    }
}

impl JobTemplate for DeliveryWorkerTemplate {
    fn template_type(&self) -> &'static str {
        Self::template_type_for(self.channel)
    }

    fn name(&self) -> &'static str {
        match self.channel {
            Channel::Email => "Email Notifier",
            Channel::Sms => "SMS Notifier",
            Channel::Push => "Push Notifier",
        }
    }

    fn description(&self) -> &'static str {
        match self.channel {
            Channel::Email => "Deliver pending email notifications",
            Channel::Sms => "Deliver pending SMS notifications",
            Channel::Push => "Deliver pending push notifications",
        }
    }

    fn category(&self) -> &'static str {
        "notifications"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new(vec![
            ParameterSpec::integer("batchSize", 1, MAX_BATCH_SIZE, "Entries claimed per run")
                .with_default(self.default_batch_size),
            ParameterSpec::integer(
                "maxAttempts",
                1,
                MAX_ATTEMPTS_LIMIT,
                "Attempts before an entry fails permanently",
            )
            .with_default(self.default_max_attempts),
            ParameterSpec::boolean("testMode", "Send every entry to testRecipient")
                .with_default(false),
            ParameterSpec::string("testRecipient", "Address used in test mode"),
        ])
    }

    fn validate(&self, params: &Map<String, JsonValue>) -> Result<(), ValidationError> {
        let test_mode = params.get("testMode").and_then(JsonValue::as_bool) == Some(true);
        let recipient = params
            .get("testRecipient")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.trim().is_empty());
        if test_mode && recipient.is_none() {
            return Err(ValidationError::InvalidParameters(
                "testMode requires testRecipient".to_string(),
            ));
        }
        Ok(())
    }

    fn execute(
        &self,
        ctx: &JobContext,
        params: &Map<String, JsonValue>,
    ) -> Result<JobResult, JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let options = self.options(params);
        if let Some(recipient) = &options.test_recipient {
            info!(
                "{} running in test mode, all messages go to {}",
                ctx.job_id, recipient
            );
        }
        let report = ctx
            .delivery
            .run_batch(self.channel, &options, &|| ctx.is_cancelled())?;

        let message = format!(
            "claimed {}, sent {}, retried {}, failed {}",
            report.claimed, report.sent, report.retried, report.failed
        );
        // Provider failures are retried per entry and do not fail the run.
        Ok(JobResult::from_counts(
            message,
            report.claimed as u64,
            report.sent as u64,
            report.errors.clone(),
        )
        .with_details(serde_json::to_value(&report).unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::test_support::{context, register_user};
    use crate::notifications::{
        EnqueueRequest, NotificationStore, NotificationTrigger, QueueFilter, QueueStatus,
    };
    use serde_json::json;

    fn template() -> DeliveryWorkerTemplate {
        DeliveryWorkerTemplate::new(Channel::Email, 50, 3)
    }

    #[test]
    fn test_schema_defaults_and_limits() {
        let schema = template().parameter_schema();
        let defaults = schema.defaults();
        assert_eq!(defaults["batchSize"], json!(50));
        assert_eq!(defaults["maxAttempts"], json!(3));
        assert!(schema.validate(&json!({"batchSize": 501})).is_err());
        assert!(schema.validate(&json!({"maxAttempts": 11})).is_err());
        assert!(schema.validate(&json!({"batchSize": 500, "maxAttempts": 10})).is_ok());
    }

    #[test]
    fn test_test_mode_requires_recipient() {
        let t = template();
        let mut params = Map::new();
        params.insert("testMode".to_string(), json!(true));
        assert!(t.validate(&params).is_err());
        params.insert("testRecipient".to_string(), json!("qa@example.com"));
        assert!(t.validate(&params).is_ok());
        assert_eq!(
            t.options(&params).test_recipient.as_deref(),
            Some("qa@example.com")
        );
    }

    #[test]
    fn test_execute_delivers_due_entries() {
        let (ctx, fixture) = context();
        register_user(&fixture, "alice", "alice@example.com");
        fixture
            .service
            .enqueue(
                &EnqueueRequest::new("alice", NotificationTrigger::Favorited, &[Channel::Email])
                    .from_actor("bob"),
            )
            .unwrap();

        let params = template()
            .parameter_schema()
            .with_defaults(&JsonValue::Null)
            .unwrap();
        let result = template().execute(&ctx, &params).unwrap();
        assert_eq!(result.records_processed, 1);
        assert_eq!(result.records_affected, 1);
        assert!(!result.is_failure());

        let entries = fixture
            .store
            .list_queue(&QueueFilter::default())
            .unwrap();
        assert_eq!(entries[0].status, QueueStatus::Sent);
    }

    #[test]
    fn test_cancelled_before_start() {
        let (ctx, _fixture) = context();
        ctx.cancellation_token.cancel();
        let params = Map::new();
        assert!(matches!(
            template().execute(&ctx, &params),
            Err(JobError::Cancelled)
        ));
    }
}
