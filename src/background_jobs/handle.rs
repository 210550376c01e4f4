use super::job::{JobError, ValidationError};
use super::registry::{JobTemplateRegistry, TemplateInfo};
use super::schedule::{resolve_timezone, JobSchedule};
use crate::job_store::{JobDefinition, JobExecution, JobStore, LastRunStatus};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

/// Command sent to the scheduler loop.
pub enum SchedulerCommand {
    RunNow {
        job_id: String,
        response: oneshot::Sender<Result<i64, JobError>>,
    },
}

fn default_enabled() -> bool {
    true
}

/// Body of a job creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub template_type: String,
    #[serde(default)]
    pub parameters: JsonValue,
    pub schedule: JobSchedule,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Partial update of a job definition. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parameters: Option<JsonValue>,
    pub schedule: Option<JobSchedule>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub timeout_seconds: Option<u64>,
}

/// Handle to the job scheduler for HTTP handlers and startup code.
///
/// Definition CRUD goes straight to the job store. Manual runs are sent to
/// the scheduler loop so that they share the running-flag guard with
/// scheduled runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    started: Arc<AtomicBool>,
    registry: Arc<JobTemplateRegistry>,
    job_store: Arc<dyn JobStore>,
    default_timezone: Tz,
    default_timeout_secs: u64,
}

impl SchedulerHandle {
    pub fn new(
        command_tx: mpsc::Sender<SchedulerCommand>,
        started: Arc<AtomicBool>,
        registry: Arc<JobTemplateRegistry>,
        job_store: Arc<dyn JobStore>,
        default_timezone: Tz,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            command_tx,
            started,
            registry,
            job_store,
            default_timezone,
            default_timeout_secs,
        }
    }

    /// Whether the scheduler loop has been started and accepts manual runs.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn list_templates(&self) -> Vec<TemplateInfo> {
        self.registry.list()
    }

    pub fn list_jobs(&self) -> Result<Vec<JobDefinition>, JobError> {
        Ok(self.job_store.list_jobs()?)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobDefinition, JobError> {
        self.job_store.get_job(job_id)?.ok_or(JobError::NotFound)
    }

    pub fn create_job(
        &self,
        request: CreateJobRequest,
        actor: Option<&str>,
    ) -> Result<JobDefinition, JobError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(invalid_field("name", "must not be empty"));
        }
        let id = match request.id {
            Some(id) if id.trim().is_empty() => return Err(invalid_field("id", "must not be empty")),
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        if self.job_store.get_job(&id)?.is_some() {
            return Err(invalid_field("id", "a job with this id already exists"));
        }
        self.ensure_unique_name(&name, None)?;

        let parameters = self
            .registry
            .prepare_parameters(&request.template_type, &request.parameters)?;
        request.schedule.validate()?;
        let tz = resolve_timezone(request.timezone.as_deref(), self.default_timezone)?;
        let timeout_seconds = request.timeout_seconds.unwrap_or(self.default_timeout_secs);
        if timeout_seconds == 0 {
            return Err(invalid_field("timeout_seconds", "must be greater than zero"));
        }

        let now = Utc::now();
        let next_run_at = if request.enabled {
            Some(request.schedule.next_run(None, now, tz)?)
        } else {
            None
        };
        let job = JobDefinition {
            id,
            name,
            description: request.description,
            template_type: request.template_type,
            parameters: JsonValue::Object(parameters),
            schedule: request.schedule,
            timezone: request.timezone,
            enabled: request.enabled,
            timeout_seconds,
            last_run_at: None,
            next_run_at,
            last_status: LastRunStatus::NeverRun,
            last_error: None,
            running: false,
            consecutive_failures: 0,
            created_by: actor.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.job_store.create_job(&job)?;
        info!(
            "Created job {} ({}) from template {} by {}",
            job.id,
            job.name,
            job.template_type,
            actor.unwrap_or("system")
        );
        Ok(job)
    }

    pub fn update_job(
        &self,
        job_id: &str,
        update: UpdateJobRequest,
    ) -> Result<JobDefinition, JobError> {
        let mut job = self.get_job(job_id)?;
        let was_enabled = job.enabled;
        let mut reschedule = false;

        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(invalid_field("name", "must not be empty"));
            }
            self.ensure_unique_name(&name, Some(job_id))?;
            job.name = name;
        }
        if let Some(description) = update.description {
            job.description = Some(description).filter(|d| !d.is_empty());
        }
        if let Some(parameters) = update.parameters {
            job.parameters = JsonValue::Object(
                self.registry
                    .prepare_parameters(&job.template_type, &parameters)?,
            );
        }
        if let Some(schedule) = update.schedule {
            schedule.validate()?;
            reschedule |= schedule != job.schedule;
            job.schedule = schedule;
        }
        if let Some(timezone) = update.timezone {
            let timezone = Some(timezone).filter(|tz| !tz.is_empty());
            resolve_timezone(timezone.as_deref(), self.default_timezone)?;
            reschedule |= timezone != job.timezone;
            job.timezone = timezone;
        }
        if let Some(timeout_seconds) = update.timeout_seconds {
            if timeout_seconds == 0 {
                return Err(invalid_field("timeout_seconds", "must be greater than zero"));
            }
            job.timeout_seconds = timeout_seconds;
        }
        if let Some(enabled) = update.enabled {
            job.enabled = enabled;
            reschedule |= enabled && !was_enabled;
        }

        if reschedule || (job.enabled && job.next_run_at.is_none()) {
            job.next_run_at = Some(self.compute_next_run(&job, Utc::now())?);
        }
        job.updated_at = Utc::now();

        if !self.job_store.update_job(&job)? {
            return Err(JobError::NotFound);
        }
        info!("Updated job {}", job.id);
        Ok(job)
    }

    pub fn delete_job(&self, job_id: &str) -> Result<(), JobError> {
        if !self.job_store.delete_job(job_id)? {
            return Err(JobError::NotFound);
        }
        info!("Deleted job {}", job_id);
        Ok(())
    }

    /// Enables or disables a job. Re-enabling recomputes the next run.
    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<JobDefinition, JobError> {
        let job = self.get_job(job_id)?;
        let next_run_at = if enabled && !job.enabled {
            Some(self.compute_next_run(&job, Utc::now())?)
        } else {
            None
        };
        if !self.job_store.set_enabled(job_id, enabled, next_run_at)? {
            return Err(JobError::NotFound);
        }
        info!(
            "Job {} {}",
            job_id,
            if enabled { "enabled" } else { "disabled" }
        );
        self.get_job(job_id)
    }

    /// Runs a job immediately, outside its schedule. Returns the execution id.
    pub async fn run_now(&self, job_id: &str) -> Result<i64, JobError> {
        if !self.is_running() {
            return Err(JobError::ExecutionFailed(
                "Scheduler not running".to_string(),
            ));
        }
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(SchedulerCommand::RunNow {
                job_id: job_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler not available".to_string()))?;

        response_rx
            .await
            .map_err(|_| JobError::ExecutionFailed("Scheduler dropped request".to_string()))?
    }

    pub fn get_job_executions(
        &self,
        job_id: &str,
        limit: usize,
    ) -> Result<Vec<JobExecution>, JobError> {
        self.get_job(job_id)?;
        Ok(self.job_store.get_executions(job_id, limit)?)
    }

    /// Creates `defaults` when no job definitions exist yet.
    pub fn seed_defaults_if_empty(
        &self,
        defaults: Vec<CreateJobRequest>,
    ) -> Result<usize, JobError> {
        if self.job_store.count_jobs()? > 0 {
            return Ok(0);
        }
        let count = defaults.len();
        for request in defaults {
            self.create_job(request, Some("system"))?;
        }
        info!("Seeded {} default jobs", count);
        Ok(count)
    }

    fn compute_next_run(
        &self,
        job: &JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        let tz = resolve_timezone(job.timezone.as_deref(), self.default_timezone)?;
        let next = job.schedule.next_run(job.last_run_at, now, tz)?;
        Ok(next.max(now))
    }

    fn ensure_unique_name(&self, name: &str, except_id: Option<&str>) -> Result<(), JobError> {
        let taken = self
            .job_store
            .list_jobs()?
            .iter()
            .any(|j| j.name == name && Some(j.id.as_str()) != except_id);
        if taken {
            return Err(invalid_field("name", "a job with this name already exists"));
        }
        Ok(())
    }
}

fn invalid_field(field: &str, message: &str) -> JobError {
    JobError::Validation(ValidationError::InvalidField {
        field: field.to_string(),
        message: message.to_string(),
    })
}
