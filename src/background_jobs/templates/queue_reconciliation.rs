//! Returns queue entries stuck in `processing` to `pending`.
//!
//! A delivery run that crashes or is cancelled after claiming leaves its
//! entries in processing. Entries older than `staleAfterSeconds` are
//! requeued, or failed once they have used up their attempts.

use crate::background_jobs::context::JobContext;
use crate::background_jobs::job::{JobError, JobResult, JobTemplate};
use crate::background_jobs::parameters::{ParameterSchema, ParameterSpec};
use crate::server::metrics;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, warn};

pub const DEFAULT_STALE_AFTER_SECS: u64 = 900;

pub struct QueueReconciliationTemplate {
    default_stale_after_secs: u64,
    max_attempts: u32,
}

impl QueueReconciliationTemplate {
    pub fn new(default_stale_after_secs: u64, max_attempts: u32) -> Self {
        Self {
            default_stale_after_secs,
            max_attempts,
        }
    }
}

impl JobTemplate for QueueReconciliationTemplate {
    fn template_type(&self) -> &'static str {
        "queue_reconciliation"
    }

    fn name(&self) -> &'static str {
        "Queue Reconciliation"
    }

    fn description(&self) -> &'static str {
        "Requeue notifications abandoned in processing"
    }

    fn category(&self) -> &'static str {
        "notifications"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new(vec![ParameterSpec::integer(
            "staleAfterSeconds",
            60,
            86_400,
            "Age after which a processing entry is considered abandoned",
        )
        .with_default(self.default_stale_after_secs)])
    }

    fn execute(
        &self,
        ctx: &JobContext,
        params: &Map<String, JsonValue>,
    ) -> Result<JobResult, JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let stale_after = params
            .get("staleAfterSeconds")
            .and_then(JsonValue::as_i64)
            .unwrap_or(self.default_stale_after_secs as i64);
        let stale_before = Utc::now() - Duration::seconds(stale_after);

        let report = ctx
            .notification_store
            .requeue_stale(stale_before, self.max_attempts)?;
        metrics::record_reconciled(report.requeued, report.failed);

        if report.requeued + report.failed > 0 {
            warn!(
                "Reconciled stale notifications: {} requeued, {} failed",
                report.requeued, report.failed
            );
        } else {
            info!("No stale notifications in processing");
        }

        let affected = (report.requeued + report.failed) as u64;
        Ok(JobResult::from_counts(
            format!("requeued {}, failed {}", report.requeued, report.failed),
            affected,
            affected,
            Vec::new(),
        )
        .with_details(json!({
            "requeued": report.requeued,
            "failed": report.failed,
            "staleAfterSeconds": stale_after,
        })))
    }
}
