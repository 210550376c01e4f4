use crate::background_jobs::JobSchedule;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Status of the most recent completed run of a job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LastRunStatus {
    NeverRun,
    Success,
    Failure,
}

impl LastRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LastRunStatus::NeverRun => "never_run",
            LastRunStatus::Success => "success",
            LastRunStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never_run" => Some(LastRunStatus::NeverRun),
            "success" => Some(LastRunStatus::Success),
            "failure" => Some(LastRunStatus::Failure),
            _ => None,
        }
    }
}

/// A persisted, schedulable unit of work bound to a template type.
#[derive(Debug, Clone, Serialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub template_type: String,
    pub parameters: JsonValue,
    pub schedule: JobSchedule,
    /// IANA timezone name; the scheduler default applies when absent.
    pub timezone: Option<String>,
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: LastRunStatus,
    pub last_error: Option<String>,
    pub running: bool,
    pub consecutive_failures: u32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failure,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failure" => Some(ExecutionStatus::Failure),
            "timeout" => Some(ExecutionStatus::Timeout),
            _ => None,
        }
    }
}

/// What caused an execution to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Manual,
    Startup,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Schedule => "schedule",
            TriggerSource::Manual => "manual",
            TriggerSource::Startup => "startup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schedule" => Some(TriggerSource::Schedule),
            "manual" => Some(TriggerSource::Manual),
            "startup" => Some(TriggerSource::Startup),
            _ => None,
        }
    }
}

/// One recorded execution of a job definition.
#[derive(Debug, Clone, Serialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub triggered_by: TriggerSource,
    pub duration_ms: Option<i64>,
    pub message: Option<String>,
    pub records_processed: u64,
    pub records_affected: u64,
    pub errors: Vec<String>,
    pub error: Option<String>,
}

/// Final state written when an execution finishes.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub duration_ms: i64,
    pub message: Option<String>,
    pub records_processed: u64,
    pub records_affected: u64,
    pub errors: Vec<String>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn failed(status: ExecutionStatus, duration_ms: i64, error: impl Into<String>) -> Self {
        Self {
            status,
            duration_ms,
            message: None,
            records_processed: 0,
            records_affected: 0,
            errors: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Values written to a job definition when a run completes.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub last_run_at: DateTime<Utc>,
    pub status: LastRunStatus,
    pub error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}
