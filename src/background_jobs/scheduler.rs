use super::context::JobContext;
use super::handle::{SchedulerCommand, SchedulerHandle};
use super::job::{JobError, JobResult, JobTemplate, ShutdownBehavior, ValidationError};
use super::registry::JobTemplateRegistry;
use super::schedule::{resolve_timezone, JobSchedule};
use crate::config::SchedulerSettings;
use crate::job_store::{
    CompletedRun, ExecutionOutcome, ExecutionStatus, JobDefinition, JobStore, LastRunStatus,
    TriggerSource,
};
use crate::server::metrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An execution in flight, tracked for shutdown.
struct RunningExecution {
    execution_id: i64,
    cancel_token: CancellationToken,
    behavior: ShutdownBehavior,
    handle: Option<JoinHandle<()>>,
}

/// State shared between the scheduler loop and the execution tasks it spawns.
struct SchedulerCore {
    settings: SchedulerSettings,
    registry: Arc<JobTemplateRegistry>,
    job_store: Arc<dyn JobStore>,
    job_context: JobContext,
    permits: Arc<Semaphore>,
    shutdown_token: CancellationToken,
    running: Mutex<HashMap<String, RunningExecution>>,
}

/// Process-wide job scheduler.
///
/// A single loop ticks at a fixed interval, picks up enabled job definitions
/// whose `next_run_at` has passed and runs each on a blocking thread. The
/// persisted `running` flag guarantees at most one execution per definition;
/// a semaphore bounds how many definitions execute at once.
pub struct UnifiedScheduler {
    core: Arc<SchedulerCore>,
    command_rx: Mutex<Option<mpsc::Receiver<SchedulerCommand>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    started: Arc<AtomicBool>,
}

impl UnifiedScheduler {
    /// Starts the tick loop. Returns false, doing nothing, if already started.
    pub fn start(&self) -> bool {
        let Some(command_rx) = self.command_rx.lock().unwrap().take() else {
            warn!("Scheduler already started, ignoring start()");
            return false;
        };

        self.core.recover_from_previous_run();

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            core.run(command_rx).await;
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
        self.started.store(true, Ordering::SeqCst);
        true
    }

    /// Dispatches every due job once. Returns how many were started.
    pub fn tick(&self) -> usize {
        self.core.tick(TriggerSource::Schedule)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Ids of the job definitions currently executing in this process.
    pub fn running_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.core.running.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops the loop, cancels cancellable executions and waits for running
    /// executions up to the shutdown grace period.
    pub async fn stop(&self) {
        info!("Stopping scheduler...");
        self.started.store(false, Ordering::SeqCst);
        self.core.shutdown_token.cancel();

        let loop_handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = loop_handle {
            let _ = handle.await;
        }

        let mut waiting = Vec::new();
        {
            let mut running = self.core.running.lock().unwrap();
            for (job_id, execution) in running.iter_mut() {
                if execution.behavior == ShutdownBehavior::Cancellable {
                    debug!("Cancelling job: {}", job_id);
                    execution.cancel_token.cancel();
                } else {
                    info!("Waiting for job {} to complete...", job_id);
                }
                if let Some(handle) = execution.handle.take() {
                    waiting.push((job_id.clone(), handle));
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.core.settings.shutdown_grace();
        for (job_id, handle) in waiting {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("Job {} did not finish within the shutdown grace period", job_id);
            }
        }
        info!("Scheduler stopped");
    }
}

impl SchedulerCore {
    /// Clears state left behind by a process that exited mid-run.
    fn recover_from_previous_run(&self) {
        match self.job_store.clear_stale_running() {
            Ok(count) if count > 0 => {
                info!("Cleared running flag on {} jobs from previous run", count)
            }
            Ok(_) => {}
            Err(e) => error!("Failed to clear stale running flags: {:#}", e),
        }
        match self.job_store.fail_interrupted_executions() {
            Ok(count) if count > 0 => {
                info!("Marked {} interrupted executions as failed", count)
            }
            Ok(_) => {}
            Err(e) => error!("Failed to mark interrupted executions: {:#}", e),
        }
    }

    async fn run(self: Arc<Self>, mut command_rx: mpsc::Receiver<SchedulerCommand>) {
        info!(
            "Starting job scheduler (tick every {}s, {} concurrent jobs, {} templates)",
            self.settings.tick_interval_secs,
            self.settings.max_concurrent_jobs,
            self.registry.len()
        );

        let mut ticker = tokio::time::interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let mut source = TriggerSource::Startup;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = self.tick(source);
                    if started > 0 {
                        debug!("Tick started {} jobs", started);
                    }
                    source = TriggerSource::Schedule;
                }
                Some(cmd) = command_rx.recv() => {
                    self.handle_command(cmd);
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        info!("Job scheduler loop exited");
    }

    fn handle_command(self: &Arc<Self>, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::RunNow { job_id, response } => {
                let result = self.run_now(&job_id);
                let _ = response.send(result);
            }
        }
    }

    fn tick(self: &Arc<Self>, source: TriggerSource) -> usize {
        let due = match self.job_store.get_due_jobs(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to load due jobs: {:#}", e);
                return 0;
            }
        };

        let mut started = 0;
        for job in due {
            let job_id = job.id.clone();
            match self.dispatch(job, source) {
                Ok(_) => started += 1,
                Err(JobError::AlreadyRunning) => {
                    debug!("Skipping job {}, already running", job_id);
                }
                Err(e) => error!("Failed to dispatch job {}: {}", job_id, e),
            }
        }
        started
    }

    fn run_now(self: &Arc<Self>, job_id: &str) -> Result<i64, JobError> {
        let job = self.job_store.get_job(job_id)?.ok_or(JobError::NotFound)?;
        if !job.enabled {
            return Err(JobError::Disabled);
        }
        if job.running {
            return Err(JobError::AlreadyRunning);
        }
        self.dispatch(job, TriggerSource::Manual)
    }

    /// Marks `job` running and spawns its execution. Fails with
    /// `AlreadyRunning` when another execution holds the running flag.
    fn dispatch(self: &Arc<Self>, job: JobDefinition, source: TriggerSource) -> Result<i64, JobError> {
        if !self.job_store.try_mark_running(&job.id)? {
            return Err(JobError::AlreadyRunning);
        }

        let started_at = Utc::now();
        let execution_id = match self.job_store.record_execution_start(&job.id, source) {
            Ok(id) => id,
            Err(e) => {
                let message = format!("Failed to record execution start: {:#}", e);
                error!("Job {}: {}", job.id, message);
                self.complete(&job, started_at, LastRunStatus::Failure, Some(message));
                return Err(JobError::Storage(e));
            }
        };

        let template = self.registry.resolve(&job.template_type);
        let behavior = template
            .as_ref()
            .map(|t| t.shutdown_behavior())
            .unwrap_or_default();
        let cancel_token = CancellationToken::new();

        info!(
            "Starting job: {} (execution_id: {}, triggered_by: {})",
            job.id,
            execution_id,
            source.as_str()
        );
        metrics::set_job_running(&job.id, true);

        let job_id = job.id.clone();
        self.running.lock().unwrap().insert(
            job_id.clone(),
            RunningExecution {
                execution_id,
                cancel_token: cancel_token.clone(),
                behavior,
                handle: None,
            },
        );

        let core = Arc::clone(self);
        let handle = tokio::spawn(async move {
            core.execute(job, template, execution_id, started_at, cancel_token)
                .await;
        });

        // The task may already have finished and removed its entry.
        if let Some(execution) = self.running.lock().unwrap().get_mut(&job_id) {
            if execution.execution_id == execution_id {
                execution.handle = Some(handle);
            }
        }
        Ok(execution_id)
    }

    async fn execute(
        self: Arc<Self>,
        job: JobDefinition,
        template: Result<Arc<dyn JobTemplate>, ValidationError>,
        execution_id: i64,
        started_at: DateTime<Utc>,
        cancel_token: CancellationToken,
    ) {
        let start_time = Instant::now();
        let result = self
            .run_template(&job, template, execution_id, cancel_token)
            .await;
        let elapsed = start_time.elapsed();

        self.record_outcome(&job, execution_id, started_at, elapsed, result);

        let mut running = self.running.lock().unwrap();
        if running
            .get(&job.id)
            .is_some_and(|execution| execution.execution_id == execution_id)
        {
            running.remove(&job.id);
        }
    }

    async fn run_template(
        &self,
        job: &JobDefinition,
        template: Result<Arc<dyn JobTemplate>, ValidationError>,
        execution_id: i64,
        cancel_token: CancellationToken,
    ) -> Result<JobResult, JobError> {
        let template = template?;
        // Parameters are re-checked on every run so that definitions gone
        // stale against a changed schema fail instead of being coerced.
        let params = self
            .registry
            .prepare_parameters(&job.template_type, &job.parameters)?;

        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| JobError::Cancelled)?;

        let ctx = self
            .job_context
            .for_execution(cancel_token.clone(), &job.id, execution_id);
        let timeout = Duration::from_secs(job.timeout_seconds);
        let task = tokio::task::spawn_blocking(move || template.execute(&ctx, &params));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(JobError::ExecutionFailed(format!("Task panic: {}", e))),
            Err(_) => {
                // The blocking thread cannot be aborted; ask it to stop.
                cancel_token.cancel();
                Err(JobError::Timeout)
            }
        }
    }

    fn record_outcome(
        &self,
        job: &JobDefinition,
        execution_id: i64,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        result: Result<JobResult, JobError>,
    ) {
        let duration_ms = elapsed.as_millis() as i64;
        let (outcome, last_status) = match result {
            Ok(result) => {
                let failed = result.is_failure();
                if failed {
                    error!(
                        "Job {} (execution_id: {}) failed after {:?}: {}",
                        job.id, execution_id, elapsed, result.message
                    );
                } else {
                    info!(
                        "Job {} (execution_id: {}) completed in {:?}: {}",
                        job.id, execution_id, elapsed, result.message
                    );
                }
                let outcome = ExecutionOutcome {
                    status: if failed {
                        ExecutionStatus::Failure
                    } else {
                        ExecutionStatus::Success
                    },
                    duration_ms,
                    error: failed.then(|| {
                        result
                            .errors
                            .first()
                            .cloned()
                            .unwrap_or_else(|| result.message.clone())
                    }),
                    message: Some(result.message),
                    records_processed: result.records_processed,
                    records_affected: result.records_affected,
                    errors: result.errors,
                };
                let status = if failed {
                    LastRunStatus::Failure
                } else {
                    LastRunStatus::Success
                };
                (outcome, status)
            }
            Err(JobError::Timeout) => {
                let message = format!("timed out after {}s", job.timeout_seconds);
                error!(
                    "Job {} (execution_id: {}) {}",
                    job.id, execution_id, message
                );
                (
                    ExecutionOutcome::failed(ExecutionStatus::Timeout, duration_ms, message),
                    LastRunStatus::Failure,
                )
            }
            Err(e) => {
                error!(
                    "Job {} (execution_id: {}) failed after {:?}: {}",
                    job.id, execution_id, elapsed, e
                );
                (
                    ExecutionOutcome::failed(ExecutionStatus::Failure, duration_ms, e.to_string()),
                    LastRunStatus::Failure,
                )
            }
        };

        if let Err(e) = self.job_store.record_execution_finish(execution_id, &outcome) {
            error!(
                "Failed to record finish of execution {} for {}: {:#}",
                execution_id, job.id, e
            );
        }

        metrics::record_job_execution(&job.id, outcome.status.as_str(), elapsed);
        self.complete(job, started_at, last_status, outcome.error);
    }

    /// Writes the run result on the definition, computes the next run and
    /// clears the running flag.
    fn complete(
        &self,
        job: &JobDefinition,
        started_at: DateTime<Utc>,
        status: LastRunStatus,
        error: Option<String>,
    ) {
        let next_run_at = match self.next_run_after_completion(job, started_at, Utc::now()) {
            Ok(next) => Some(next),
            Err(e) => {
                error!("Cannot compute next run for job {}: {}", job.id, e);
                None
            }
        };

        let run = CompletedRun {
            last_run_at: started_at,
            status,
            error,
            next_run_at,
        };
        match self.job_store.complete_run(&job.id, &run) {
            Ok(failures) => {
                metrics::set_job_consecutive_failures(&job.id, failures);
                if failures > 1 {
                    warn!("Job {} has failed {} times in a row", job.id, failures);
                }
            }
            Err(e) => error!("Failed to record completion of job {}: {:#}", job.id, e),
        }
        metrics::set_job_running(&job.id, false);
    }

    /// Interval jobs keep their cadence from the start of the run. Cron jobs
    /// take the first occurrence after the run finished, so a long run never
    /// queues up missed occurrences.
    fn next_run_after_completion(
        &self,
        job: &JobDefinition,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        let tz = resolve_timezone(job.timezone.as_deref(), self.settings.default_timezone)?;
        match job.schedule {
            JobSchedule::Interval { .. } => job.schedule.next_run_after(started_at, tz),
            JobSchedule::Cron { .. } => job.schedule.next_run_after(finished_at, tz),
        }
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    settings: SchedulerSettings,
    registry: Arc<JobTemplateRegistry>,
    job_context: JobContext,
) -> (UnifiedScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let started = Arc::new(AtomicBool::new(false));
    let job_store = Arc::clone(&job_context.job_store);

    let handle = SchedulerHandle::new(
        command_tx,
        Arc::clone(&started),
        Arc::clone(&registry),
        Arc::clone(&job_store),
        settings.default_timezone,
        settings.default_timeout_secs,
    );

    let core = SchedulerCore {
        permits: Arc::new(Semaphore::new(settings.max_concurrent_jobs)),
        shutdown_token: job_context.cancellation_token.child_token(),
        running: Mutex::new(HashMap::new()),
        settings,
        registry,
        job_store,
        job_context,
    };

    let scheduler = UnifiedScheduler {
        core: Arc::new(core),
        command_rx: Mutex::new(Some(command_rx)),
        loop_handle: Mutex::new(None),
        started,
    };

    (scheduler, handle)
}
