use super::models::{
    CompletedRun, ExecutionOutcome, ExecutionStatus, JobDefinition, JobExecution, LastRunStatus,
    TriggerSource,
};
use super::schema::JOB_VERSIONED_SCHEMAS;
use super::JobStore;
use crate::background_jobs::JobSchedule;
use crate::sqlite_persistence::{format_datetime, open_in_memory, open_versioned_db, parse_datetime};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const MAX_STORED_ERRORS: usize = 10;

const JOB_COLUMNS: &str = "id, name, description, template_type, parameters, schedule_type, \
    schedule_value, timezone, enabled, timeout_seconds, last_run_at, next_run_at, last_status, \
    last_error, running, consecutive_failures, created_by, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, job_id, started_at, finished_at, status, triggered_by, \
    duration_ms, message, records_processed, records_affected, errors, error";

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path, JOB_VERSIONED_SCHEMAS, "jobs")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(JOB_VERSIONED_SCHEMAS)?)),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobDefinition> {
        let parameters: String = row.get("parameters")?;
        let schedule_type: String = row.get("schedule_type")?;
        let schedule_value: String = row.get("schedule_value")?;
        let schedule = JobSchedule::from_parts(&schedule_type, &schedule_value)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
        let last_status: String = row.get("last_status")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(JobDefinition {
            id: row.get("id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            template_type: row.get("template_type")?,
            parameters: serde_json::from_str(&parameters).unwrap_or(serde_json::Value::Null),
            schedule,
            timezone: row.get("timezone")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            timeout_seconds: row.get::<_, i64>("timeout_seconds")? as u64,
            last_run_at: row
                .get::<_, Option<String>>("last_run_at")?
                .and_then(|s| parse_datetime(&s)),
            next_run_at: row
                .get::<_, Option<String>>("next_run_at")?
                .and_then(|s| parse_datetime(&s)),
            last_status: LastRunStatus::parse(&last_status).unwrap_or(LastRunStatus::NeverRun),
            last_error: row.get("last_error")?,
            running: row.get::<_, i64>("running")? != 0,
            consecutive_failures: row.get::<_, i64>("consecutive_failures")? as u32,
            created_by: row.get("created_by")?,
            created_at: parse_datetime(&created_at).unwrap_or_else(Utc::now),
            updated_at: parse_datetime(&updated_at).unwrap_or_else(Utc::now),
        })
    }

    fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<JobExecution> {
        let started_at: String = row.get("started_at")?;
        let status: String = row.get("status")?;
        let triggered_by: String = row.get("triggered_by")?;
        let errors: Option<String> = row.get("errors")?;

        Ok(JobExecution {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            started_at: parse_datetime(&started_at).unwrap_or_else(Utc::now),
            finished_at: row
                .get::<_, Option<String>>("finished_at")?
                .and_then(|s| parse_datetime(&s)),
            status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failure),
            triggered_by: TriggerSource::parse(&triggered_by).unwrap_or(TriggerSource::Schedule),
            duration_ms: row.get("duration_ms")?,
            message: row.get("message")?,
            records_processed: row.get::<_, i64>("records_processed")? as u64,
            records_affected: row.get::<_, i64>("records_affected")? as u64,
            errors: errors
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            error: row.get("error")?,
        })
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, job: &JobDefinition) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO job_definitions ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                JOB_COLUMNS
            ),
            params![
                job.id,
                job.name,
                job.description,
                job.template_type,
                job.parameters.to_string(),
                job.schedule.kind(),
                job.schedule.value(),
                job.timezone,
                job.enabled as i64,
                job.timeout_seconds as i64,
                job.last_run_at.as_ref().map(format_datetime),
                job.next_run_at.as_ref().map(format_datetime),
                job.last_status.as_str(),
                job.last_error,
                job.running as i64,
                job.consecutive_failures as i64,
                job.created_by,
                format_datetime(&job.created_at),
                format_datetime(&job.updated_at),
            ],
        )
        .with_context(|| format!("Failed to insert job definition '{}'", job.name))?;
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<JobDefinition>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM job_definitions WHERE id = ?1", JOB_COLUMNS),
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_definitions ORDER BY name",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map([], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn count_jobs(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM job_definitions", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    fn update_job(&self, job: &JobDefinition) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE job_definitions SET name = ?2, description = ?3, parameters = ?4, \
             schedule_type = ?5, schedule_value = ?6, timezone = ?7, enabled = ?8, \
             timeout_seconds = ?9, next_run_at = ?10, updated_at = ?11 WHERE id = ?1",
            params![
                job.id,
                job.name,
                job.description,
                job.parameters.to_string(),
                job.schedule.kind(),
                job.schedule.value(),
                job.timezone,
                job.enabled as i64,
                job.timeout_seconds as i64,
                job.next_run_at.as_ref().map(format_datetime),
                format_datetime(&job.updated_at),
            ],
        )?;
        Ok(rows > 0)
    }

    fn delete_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM job_definitions WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn set_enabled(
        &self,
        id: &str,
        enabled: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE job_definitions SET enabled = ?2, next_run_at = COALESCE(?3, next_run_at), \
             updated_at = ?4 WHERE id = ?1",
            params![
                id,
                enabled as i64,
                next_run_at.as_ref().map(format_datetime),
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(rows > 0)
    }

    fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobDefinition>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_definitions \
             WHERE enabled = 1 AND running = 0 AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             ORDER BY next_run_at",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![format_datetime(&now)], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn try_mark_running(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE job_definitions SET running = 1 WHERE id = ?1 AND running = 0 AND enabled = 1",
            params![id],
        )?;
        Ok(rows == 1)
    }

    fn complete_run(&self, id: &str, run: &CompletedRun) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_definitions SET running = 0, last_run_at = ?2, last_status = ?3, \
             last_error = ?4, next_run_at = ?5, \
             consecutive_failures = CASE WHEN ?3 = 'success' THEN 0 ELSE consecutive_failures + 1 END \
             WHERE id = ?1",
            params![
                id,
                format_datetime(&run.last_run_at),
                run.status.as_str(),
                run.error,
                run.next_run_at.as_ref().map(format_datetime),
            ],
        )?;
        let failures: Option<i64> = conn
            .query_row(
                "SELECT consecutive_failures FROM job_definitions WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(failures.unwrap_or(0) as u32)
    }

    fn clear_stale_running(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE job_definitions SET running = 0 WHERE running = 1",
            [],
        )?;
        Ok(rows)
    }

    fn record_execution_start(&self, job_id: &str, triggered_by: TriggerSource) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_executions (job_id, started_at, status, triggered_by) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                job_id,
                format_datetime(&Utc::now()),
                ExecutionStatus::Running.as_str(),
                triggered_by.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn record_execution_finish(&self, execution_id: i64, outcome: &ExecutionOutcome) -> Result<()> {
        let errors: Vec<&String> = outcome.errors.iter().take(MAX_STORED_ERRORS).collect();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE job_executions SET finished_at = ?2, status = ?3, duration_ms = ?4, \
             message = ?5, records_processed = ?6, records_affected = ?7, errors = ?8, error = ?9 \
             WHERE id = ?1",
            params![
                execution_id,
                format_datetime(&Utc::now()),
                outcome.status.as_str(),
                outcome.duration_ms,
                outcome.message,
                outcome.records_processed as i64,
                outcome.records_affected as i64,
                serde_json::to_string(&errors)?,
                outcome.error,
            ],
        )?;
        Ok(())
    }

    fn get_executions(&self, job_id: &str, limit: usize) -> Result<Vec<JobExecution>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM job_executions WHERE job_id = ?1 \
             ORDER BY started_at DESC, id DESC LIMIT ?2",
            EXECUTION_COLUMNS
        ))?;
        let executions = stmt
            .query_map(params![job_id, limit as i64], Self::row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(executions)
    }

    fn fail_interrupted_executions(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE job_executions SET status = ?1, finished_at = ?2, error = 'interrupted' \
             WHERE status = ?3",
            params![
                ExecutionStatus::Failure.as_str(),
                format_datetime(&Utc::now()),
                ExecutionStatus::Running.as_str(),
            ],
        )?;
        Ok(rows)
    }

    fn cleanup_executions_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM job_executions WHERE started_at < ?1 AND status != ?2",
            params![format_datetime(&cutoff), ExecutionStatus::Running.as_str()],
        )?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn job(id: &str, next_run_at: Option<DateTime<Utc>>) -> JobDefinition {
        let now = Utc::now();
        JobDefinition {
            id: id.to_string(),
            name: format!("job {}", id),
            description: None,
            template_type: "email_notifier".to_string(),
            parameters: json!({"batchSize": 10}),
            schedule: JobSchedule::interval(60),
            timezone: None,
            enabled: true,
            timeout_seconds: 300,
            last_run_at: None,
            next_run_at,
            last_status: LastRunStatus::NeverRun,
            last_error: None,
            running: false,
            consecutive_failures: 0,
            created_by: Some("admin".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_create_and_get_job() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.create_job(&job("a", None)).unwrap();

        let loaded = store.get_job("a").unwrap().unwrap();
        assert_eq!(loaded.name, "job a");
        assert_eq!(loaded.schedule, JobSchedule::interval(60));
        assert_eq!(loaded.parameters, json!({"batchSize": 10}));
        assert_eq!(loaded.last_status, LastRunStatus::NeverRun);
        assert!(store.get_job("missing").unwrap().is_none());
        assert_eq!(store.count_jobs().unwrap(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.create_job(&job("a", None)).unwrap();
        let mut other = job("b", None);
        other.name = "job a".to_string();
        assert!(store.create_job(&other).is_err());
    }

    #[test]
    fn test_due_jobs_respect_enabled_running_and_time() {
        let store = SqliteJobStore::in_memory().unwrap();
        let now = Utc::now();
        store.create_job(&job("past", Some(now - Duration::seconds(5)))).unwrap();
        store.create_job(&job("future", Some(now + Duration::hours(1)))).unwrap();
        store.create_job(&job("disabled", Some(now - Duration::seconds(5)))).unwrap();
        store.set_enabled("disabled", false, None).unwrap();

        let due: Vec<String> = store.get_due_jobs(now).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(due, vec!["past".to_string()]);

        assert!(store.try_mark_running("past").unwrap());
        assert!(store.get_due_jobs(now).unwrap().is_empty());
    }

    #[test]
    fn test_try_mark_running_is_exclusive() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.create_job(&job("a", None)).unwrap();
        store.create_job(&job("off", None)).unwrap();
        store.set_enabled("off", false, None).unwrap();

        assert!(store.try_mark_running("a").unwrap());
        assert!(!store.try_mark_running("a").unwrap());
        assert!(!store.try_mark_running("off").unwrap());
        assert!(!store.try_mark_running("missing").unwrap());
    }

    #[test]
    fn test_complete_run_tracks_consecutive_failures() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.create_job(&job("a", None)).unwrap();
        let now = Utc::now();
        let failure = CompletedRun {
            last_run_at: now,
            status: LastRunStatus::Failure,
            error: Some("boom".to_string()),
            next_run_at: Some(now + Duration::seconds(60)),
        };

        store.try_mark_running("a").unwrap();
        assert_eq!(store.complete_run("a", &failure).unwrap(), 1);
        store.try_mark_running("a").unwrap();
        assert_eq!(store.complete_run("a", &failure).unwrap(), 2);

        let loaded = store.get_job("a").unwrap().unwrap();
        assert!(!loaded.running);
        assert!(loaded.enabled, "failures never disable a job");
        assert_eq!(loaded.last_status, LastRunStatus::Failure);
        assert_eq!(loaded.last_error.as_deref(), Some("boom"));

        let success = CompletedRun {
            status: LastRunStatus::Success,
            error: None,
            ..failure
        };
        store.try_mark_running("a").unwrap();
        assert_eq!(store.complete_run("a", &success).unwrap(), 0);
    }

    #[test]
    fn test_update_and_delete_job() {
        let store = SqliteJobStore::in_memory().unwrap();
        let mut j = job("a", None);
        store.create_job(&j).unwrap();

        j.schedule = JobSchedule::cron("0 9 * * MON");
        j.timezone = Some("Europe/Rome".to_string());
        assert!(store.update_job(&j).unwrap());
        let loaded = store.get_job("a").unwrap().unwrap();
        assert_eq!(loaded.schedule, JobSchedule::cron("0 9 * * MON"));
        assert_eq!(loaded.timezone.as_deref(), Some("Europe/Rome"));

        assert!(store.delete_job("a").unwrap());
        assert!(!store.delete_job("a").unwrap());
        assert!(!store.update_job(&j).unwrap());
    }

    #[test]
    fn test_execution_history() {
        let store = SqliteJobStore::in_memory().unwrap();
        let first = store.record_execution_start("a", TriggerSource::Startup).unwrap();
        store
            .record_execution_finish(
                first,
                &ExecutionOutcome {
                    status: ExecutionStatus::Success,
                    duration_ms: 12,
                    message: Some("sent 3".to_string()),
                    records_processed: 3,
                    records_affected: 3,
                    errors: (0..15).map(|i| format!("e{}", i)).collect(),
                    error: None,
                },
            )
            .unwrap();
        let second = store.record_execution_start("a", TriggerSource::Manual).unwrap();

        let executions = store.get_executions("a", 10).unwrap();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].id, second);
        assert_eq!(executions[0].status, ExecutionStatus::Running);
        assert_eq!(executions[1].status, ExecutionStatus::Success);
        assert_eq!(executions[1].triggered_by, TriggerSource::Startup);
        assert_eq!(executions[1].errors.len(), 10);

        assert_eq!(store.fail_interrupted_executions().unwrap(), 1);
        let executions = store.get_executions("a", 10).unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Failure);
        assert_eq!(executions[0].error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_cleanup_executions_before() {
        let store = SqliteJobStore::in_memory().unwrap();
        let id = store.record_execution_start("a", TriggerSource::Schedule).unwrap();
        store
            .record_execution_finish(
                id,
                &ExecutionOutcome::failed(ExecutionStatus::Timeout, 5, "timed out"),
            )
            .unwrap();

        assert_eq!(
            store
                .cleanup_executions_before(Utc::now() - Duration::days(1))
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .cleanup_executions_before(Utc::now() + Duration::seconds(1))
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_clear_stale_running_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let store = SqliteJobStore::new(&path).unwrap();
            store.create_job(&job("a", None)).unwrap();
            store.try_mark_running("a").unwrap();
        }

        let store = SqliteJobStore::new(&path).unwrap();
        assert!(store.get_job("a").unwrap().unwrap().running);
        assert_eq!(store.clear_stale_running().unwrap(), 1);
        assert!(!store.get_job("a").unwrap().unwrap().running);
    }
}
