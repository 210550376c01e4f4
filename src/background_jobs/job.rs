use super::context::JobContext;
use super::parameters::ParameterSchema;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// How a running execution should be handled during scheduler shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// Execution is cancelled immediately.
    #[default]
    Cancellable,
    /// Shutdown waits (up to the grace period) for the execution to finish.
    WaitForCompletion,
}

/// Errors surfaced synchronously when a job definition is created or edited,
/// and re-checked before each execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown template type: {0}")]
    UnknownTemplateType(String),
    #[error("Template type already registered: {0}")]
    DuplicateTemplateType(String),
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },
}

/// Errors that can occur while triggering or running a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found")]
    NotFound,
    #[error("Job is already running")]
    AlreadyRunning,
    #[error("Job is disabled")]
    Disabled,
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Job was cancelled")]
    Cancelled,
    #[error("Job timed out")]
    Timeout,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResultStatus {
    Success,
    Partial,
    Failed,
}

impl JobResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobResultStatus::Success => "success",
            JobResultStatus::Partial => "partial",
            JobResultStatus::Failed => "failed",
        }
    }
}

/// Outcome reported by a template execution.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub status: JobResultStatus,
    pub message: String,
    pub records_processed: u64,
    pub records_affected: u64,
    pub errors: Vec<String>,
    pub details: JsonValue,
}

impl JobResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: JobResultStatus::Success,
            message: message.into(),
            records_processed: 0,
            records_affected: 0,
            errors: Vec::new(),
            details: JsonValue::Null,
        }
    }

    /// Builds a result whose status follows from the error count: no errors
    /// is success, some is partial, all records failing is failed.
    pub fn from_counts(
        message: impl Into<String>,
        processed: u64,
        affected: u64,
        errors: Vec<String>,
    ) -> Self {
        let status = if errors.is_empty() {
            JobResultStatus::Success
        } else if affected == 0 && processed > 0 {
            JobResultStatus::Failed
        } else {
            JobResultStatus::Partial
        };
        Self {
            status,
            message: message.into(),
            records_processed: processed,
            records_affected: affected,
            errors,
            details: JsonValue::Null,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status == JobResultStatus::Failed
    }
}

/// An executable job type, registered once at startup and referenced by
/// job definitions through its `template_type` key.
///
/// Templates are executed on a blocking thread. Long-running work should
/// check `ctx.is_cancelled()` and return `JobError::Cancelled` early.
pub trait JobTemplate: Send + Sync {
    /// Unique registry key.
    fn template_type(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn category(&self) -> &'static str {
        "general"
    }

    fn parameter_schema(&self) -> ParameterSchema;

    /// Cross-field checks beyond what the schema expresses. Called after
    /// schema validation succeeds.
    fn validate(&self, _params: &Map<String, JsonValue>) -> Result<(), ValidationError> {
        Ok(())
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    /// Runs the template. `params` has already been validated and merged
    /// with the schema defaults.
    fn execute(&self, ctx: &JobContext, params: &Map<String, JsonValue>)
        -> Result<JobResult, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_status_from_counts() {
        assert_eq!(
            JobResult::from_counts("ok", 3, 3, vec![]).status,
            JobResultStatus::Success
        );
        assert_eq!(
            JobResult::from_counts("some", 3, 2, vec!["boom".into()]).status,
            JobResultStatus::Partial
        );
        let failed = JobResult::from_counts("none", 3, 0, vec!["boom".into()]);
        assert_eq!(failed.status, JobResultStatus::Failed);
        assert!(failed.is_failure());
    }

    #[test]
    fn test_validation_error_converts_to_job_error() {
        let err: JobError = ValidationError::UnknownTemplateType("x".into()).into();
        assert_eq!(err.to_string(), "Unknown template type: x");
    }
}
