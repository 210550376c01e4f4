mod models;
mod schema;
mod sqlite_job_store;

pub use models::*;
pub use schema::JOB_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Persistence for job definitions and their execution history.
pub trait JobStore: Send + Sync {
    // Definitions
    fn create_job(&self, job: &JobDefinition) -> Result<()>;
    fn get_job(&self, id: &str) -> Result<Option<JobDefinition>>;
    fn list_jobs(&self) -> Result<Vec<JobDefinition>>;
    fn count_jobs(&self) -> Result<usize>;
    /// Persists the editable fields of `job`. Returns false if it does not exist.
    fn update_job(&self, job: &JobDefinition) -> Result<bool>;
    fn delete_job(&self, id: &str) -> Result<bool>;
    fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    // Scheduling
    /// Enabled, idle definitions whose `next_run_at` is at or before `now`.
    fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobDefinition>>;
    /// Compare-and-swap of the running flag. Returns true only for the caller
    /// that moved the job from idle to running.
    fn try_mark_running(&self, id: &str) -> Result<bool>;
    /// Records the outcome of a run and clears the running flag. Returns the
    /// resulting consecutive failure count.
    fn complete_run(&self, id: &str, run: &CompletedRun) -> Result<u32>;
    /// Clears running flags left behind by a previous process.
    fn clear_stale_running(&self) -> Result<usize>;

    // Executions
    fn record_execution_start(&self, job_id: &str, triggered_by: TriggerSource) -> Result<i64>;
    fn record_execution_finish(&self, execution_id: i64, outcome: &ExecutionOutcome) -> Result<()>;
    fn get_executions(&self, job_id: &str, limit: usize) -> Result<Vec<JobExecution>>;
    /// Marks executions still `running` from a previous process as failed.
    fn fail_interrupted_executions(&self) -> Result<usize>;
    fn cleanup_executions_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
