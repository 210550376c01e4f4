//! Built-in job templates and the default job set seeded on first start.

mod delivery_worker;
mod digest_notifier;
mod history_cleanup;
mod queue_reconciliation;

pub use delivery_worker::DeliveryWorkerTemplate;
pub use digest_notifier::{DigestNotifierTemplate, DigestPeriod};
pub use history_cleanup::HistoryCleanupTemplate;
pub use queue_reconciliation::QueueReconciliationTemplate;

use super::handle::CreateJobRequest;
use super::job::ValidationError;
use super::registry::JobTemplateRegistry;
use super::schedule::JobSchedule;
use crate::config::NotificationsSettings;
use crate::notifications::Channel;
use serde_json::json;
use std::sync::Arc;

pub fn register_builtin_templates(
    registry: &mut JobTemplateRegistry,
    settings: &NotificationsSettings,
) -> Result<(), ValidationError> {
    for channel in Channel::ALL {
        registry.register(Arc::new(DeliveryWorkerTemplate::new(
            channel,
            settings.default_batch_size,
            settings.max_attempts,
        )))?;
    }
    registry.register(Arc::new(QueueReconciliationTemplate::new(
        settings.stale_processing_secs,
        settings.max_attempts,
    )))?;
    registry.register(Arc::new(HistoryCleanupTemplate::new(
        settings.log_retention_days,
    )))?;
    for period in [DigestPeriod::Weekly, DigestPeriod::Monthly] {
        registry.register(Arc::new(DigestNotifierTemplate::new(
            period,
            settings.dedup_window_secs,
        )))?;
    }
    Ok(())
}

/// Jobs created when the job store is empty.
pub fn default_job_definitions() -> Vec<CreateJobRequest> {
    let worker = |channel: Channel, id: &str, name: &str, seconds: u64| CreateJobRequest {
        id: Some(id.to_string()),
        name: name.to_string(),
        description: Some(format!("Deliver queued {} notifications", channel.as_str())),
        template_type: DeliveryWorkerTemplate::template_type_for(channel).to_string(),
        parameters: json!({}),
        schedule: JobSchedule::interval(seconds),
        timezone: None,
        enabled: true,
        timeout_seconds: None,
    };
    vec![
        worker(Channel::Email, "email-notifier", "Email notifier", 60),
        worker(Channel::Sms, "sms-notifier", "SMS notifier", 120),
        worker(Channel::Push, "push-notifier", "Push notifier", 30),
        CreateJobRequest {
            id: Some("queue-reconciliation".to_string()),
            name: "Queue reconciliation".to_string(),
            description: Some("Requeue notifications stuck in processing".to_string()),
            template_type: "queue_reconciliation".to_string(),
            parameters: json!({}),
            schedule: JobSchedule::interval(300),
            timezone: None,
            enabled: true,
            timeout_seconds: None,
        },
        CreateJobRequest {
            id: Some("history-cleanup".to_string()),
            name: "History cleanup".to_string(),
            description: Some("Prune old executions and delivery log entries".to_string()),
            template_type: "history_cleanup".to_string(),
            parameters: json!({}),
            schedule: JobSchedule::cron("0 3 * * *"),
            timezone: None,
            enabled: true,
            timeout_seconds: None,
        },
        CreateJobRequest {
            id: Some("weekly-digest".to_string()),
            name: "Weekly digest".to_string(),
            description: Some("Queue last week's activity summary".to_string()),
            template_type: DigestNotifierTemplate::template_type_for(DigestPeriod::Weekly)
                .to_string(),
            parameters: json!({}),
            schedule: JobSchedule::cron("0 18 * * SUN"),
            timezone: None,
            enabled: true,
            timeout_seconds: None,
        },
        CreateJobRequest {
            id: Some("monthly-digest".to_string()),
            name: "Monthly digest".to_string(),
            description: Some("Queue last month's activity summary".to_string()),
            template_type: DigestNotifierTemplate::template_type_for(DigestPeriod::Monthly)
                .to_string(),
            parameters: json!({}),
            schedule: JobSchedule::cron("0 9 1 * *"),
            timezone: None,
            enabled: true,
            timeout_seconds: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates_cover_default_jobs() {
        let mut registry = JobTemplateRegistry::new();
        register_builtin_templates(&mut registry, &NotificationsSettings::default()).unwrap();
        assert_eq!(registry.len(), 7);

        for job in default_job_definitions() {
            job.schedule.validate().unwrap();
            registry
                .prepare_parameters(&job.template_type, &job.parameters)
                .unwrap();
        }
    }

    #[test]
    fn test_double_registration_fails() {
        let mut registry = JobTemplateRegistry::new();
        let settings = NotificationsSettings::default();
        register_builtin_templates(&mut registry, &settings).unwrap();
        assert!(matches!(
            register_builtin_templates(&mut registry, &settings),
            Err(ValidationError::DuplicateTemplateType(_))
        ));
    }
}
