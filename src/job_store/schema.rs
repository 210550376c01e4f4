//! SQLite schema for the jobs database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const JOB_DEFINITIONS_TABLE_V1: Table = Table {
    name: "job_definitions",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("description", &SqlType::Text),
        sqlite_column!("template_type", &SqlType::Text, non_null = true),
        sqlite_column!("parameters", &SqlType::Text, non_null = true),
        sqlite_column!("schedule_type", &SqlType::Text, non_null = true),
        sqlite_column!("schedule_value", &SqlType::Text, non_null = true),
        sqlite_column!("timezone", &SqlType::Text),
        sqlite_column!("enabled", &SqlType::Integer, non_null = true, default_value = Some("1")),
        sqlite_column!("timeout_seconds", &SqlType::Integer, non_null = true),
        sqlite_column!("last_run_at", &SqlType::Text),
        sqlite_column!("next_run_at", &SqlType::Text),
        sqlite_column!(
            "last_status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'never_run'")
        ),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("running", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!(
            "consecutive_failures",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_by", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_job_definitions_due", "enabled, running, next_run_at")],
    unique_constraints: &[&["name"]],
};

const JOB_EXECUTIONS_TABLE_V1: Table = Table {
    name: "job_executions",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("started_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("triggered_by", &SqlType::Text, non_null = true),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("message", &SqlType::Text),
        sqlite_column!(
            "records_processed",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "records_affected",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        // JSON array, first 10 errors only
        sqlite_column!("errors", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
    ],
    indices: &[
        ("idx_job_executions_job_started", "job_id, started_at DESC"),
        ("idx_job_executions_status", "status"),
    ],
    unique_constraints: &[],
};

pub const JOB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[JOB_DEFINITIONS_TABLE_V1, JOB_EXECUTIONS_TABLE_V1],
    migration: None,
}];
