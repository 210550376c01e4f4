//! Prunes job execution history and the notification delivery log.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{JobError, JobResult, JobTemplate};
use crate::background_jobs::parameters::{ParameterSchema, ParameterSpec};
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value as JsonValue};
use tracing::info;

pub struct HistoryCleanupTemplate {
    default_retention_days: u32,
}

impl HistoryCleanupTemplate {
    pub fn new(default_retention_days: u32) -> Self {
        Self {
            default_retention_days,
        }
    }
}

impl JobTemplate for HistoryCleanupTemplate {
    fn template_type(&self) -> &'static str {
        "history_cleanup"
    }

    fn name(&self) -> &'static str {
        "History Cleanup"
    }

    fn description(&self) -> &'static str {
        "Delete job executions and delivery log entries past the retention period"
    }

    fn category(&self) -> &'static str {
        "maintenance"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new(vec![ParameterSpec::integer(
            "retentionDays",
            1,
            3650,
            "Days of history to keep",
        )
        .with_default(self.default_retention_days)])
    }

    fn execute(
        &self,
        ctx: &JobContext,
        params: &Map<String, JsonValue>,
    ) -> Result<JobResult, JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let retention_days = params
            .get("retentionDays")
            .and_then(JsonValue::as_i64)
            .unwrap_or(self.default_retention_days as i64);
        let cutoff = Utc::now() - Duration::days(retention_days);
        info!(
            "Cleaning up history older than {} days (cutoff: {})",
            retention_days, cutoff
        );

        let executions = ctx.job_store.cleanup_executions_before(cutoff)?;
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let log_entries = ctx.notification_store.cleanup_log_before(cutoff)?;

        if executions + log_entries > 0 {
            info!(
                "Deleted {} job executions and {} delivery log entries",
                executions, log_entries
            );
        } else {
            info!("No history to clean up");
        }

        let deleted = (executions + log_entries) as u64;
        Ok(JobResult::from_counts(
            format!(
                "deleted {} executions and {} log entries",
                executions, log_entries
            ),
            deleted,
            deleted,
            Vec::new(),
        )
        .with_details(json!({
            "executions": executions,
            "logEntries": log_entries,
            "retentionDays": retention_days,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::test_support::context;
    use crate::job_store::{ExecutionOutcome, ExecutionStatus, JobStore, TriggerSource};

    #[test]
    fn test_deletes_only_old_history() {
        let (ctx, fixture) = context();
        let id = fixture
            .job_store
            .record_execution_start("history-cleanup", TriggerSource::Manual)
            .unwrap();
        fixture
            .job_store
            .record_execution_finish(id, &ExecutionOutcome::failed(ExecutionStatus::Failure, 5, "x"))
            .unwrap();

        let template = HistoryCleanupTemplate::new(90);
        let params = template
            .parameter_schema()
            .with_defaults(&JsonValue::Null)
            .unwrap();
        let result = template.execute(&ctx, &params).unwrap();
        assert_eq!(result.records_affected, 0);

        let mut params = Map::new();
        params.insert("retentionDays".to_string(), json!(-1));
        let result = template.execute(&ctx, &params).unwrap();
        assert_eq!(result.records_affected, 1);
        assert!(fixture
            .job_store
            .get_executions("history-cleanup", 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_retention_bounds() {
        let schema = HistoryCleanupTemplate::new(90).parameter_schema();
        assert!(schema.validate(&json!({"retentionDays": 0})).is_err());
        assert!(schema.validate(&json!({"retentionDays": 3651})).is_err());
        assert_eq!(schema.defaults()["retentionDays"], json!(90));
    }
}
