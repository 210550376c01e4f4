//! SQLite schema for the notifications database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

const NOTIFICATION_PREFERENCES_TABLE_V1: Table = Table {
    name: "notification_preferences",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("username", &SqlType::Text, non_null = true),
        sqlite_column!("trigger_name", &SqlType::Text, non_null = true),
        // JSON array of channel names, possibly empty
        sqlite_column!("channels", &SqlType::Text, non_null = true),
        sqlite_column!("frequency", &SqlType::Text, non_null = true),
        sqlite_column!("time", &SqlType::Text),
        sqlite_column!("day_of_week", &SqlType::Text),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["username", "trigger_name"]],
};

const NOTIFICATION_SETTINGS_TABLE_V1: Table = Table {
    name: "notification_settings",
    columns: &[
        sqlite_column!("username", &SqlType::Text, is_primary_key = true),
        sqlite_column!("timezone", &SqlType::Text, non_null = true),
        sqlite_column!("quiet_hours", &SqlType::Text, non_null = true),
        sqlite_column!("rate_limits", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const ADMIN_OVERRIDES_TABLE_V1: Table = Table {
    name: "admin_overrides",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("target_type", &SqlType::Text, non_null = true),
        sqlite_column!("target_key", &SqlType::Text, non_null = true),
        sqlite_column!("target", &SqlType::Text, non_null = true),
        sqlite_column!("disabled", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("channels", &SqlType::Text),
        sqlite_column!("time", &SqlType::Text),
        sqlite_column!("frequency", &SqlType::Text),
        sqlite_column!("day_of_week", &SqlType::Text),
        sqlite_column!("reason", &SqlType::Text),
        sqlite_column!("overridden_by", &SqlType::Text, non_null = true),
        sqlite_column!("overridden_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["target_type", "target_key"]],
};

const ADMIN_AUDIT_LOG_TABLE_V1: Table = Table {
    name: "admin_audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("action", &SqlType::Text, non_null = true),
        sqlite_column!("target_type", &SqlType::Text, non_null = true),
        sqlite_column!("target_key", &SqlType::Text, non_null = true),
        sqlite_column!("actor", &SqlType::Text, non_null = true),
        sqlite_column!("reason", &SqlType::Text),
        sqlite_column!("details", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_admin_audit_created", "created_at DESC")],
    unique_constraints: &[],
};

const NOTIFICATION_QUEUE_TABLE_V1: Table = Table {
    name: "notification_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("username", &SqlType::Text, non_null = true),
        sqlite_column!("trigger_name", &SqlType::Text, non_null = true),
        sqlite_column!("channel", &SqlType::Text, non_null = true),
        sqlite_column!("template_data", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Text, non_null = true),
        sqlite_column!("priority_rank", &SqlType::Integer, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("scheduled_for", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("claimed_at", &SqlType::Text),
        sqlite_column!("sent_at", &SqlType::Text),
        sqlite_column!("attempts", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("dedup_key", &SqlType::Text, non_null = true),
        sqlite_column!("actor", &SqlType::Text),
    ],
    indices: &[
        ("idx_queue_claim", "status, channel, scheduled_for"),
        ("idx_queue_dedup", "username, trigger_name, dedup_key"),
        ("idx_queue_rate", "username, channel, created_at"),
    ],
    unique_constraints: &[],
};

const NOTIFICATION_LOG_TABLE_V1: Table = Table {
    name: "notification_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("queue_entry_id", &SqlType::Integer),
        sqlite_column!("username", &SqlType::Text, non_null = true),
        sqlite_column!("trigger_name", &SqlType::Text, non_null = true),
        sqlite_column!("channel", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("subject", &SqlType::Text),
        sqlite_column!("preview", &SqlType::Text),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!("is_test", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_log_username", "username, created_at DESC"),
        ("idx_log_created", "created_at"),
    ],
    unique_constraints: &[],
};

const NOTIFICATION_TEMPLATES_TABLE_V1: Table = Table {
    name: "notification_templates",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("trigger_name", &SqlType::Text, non_null = true),
        sqlite_column!("channel", &SqlType::Text, non_null = true),
        sqlite_column!("subject", &SqlType::Text, non_null = true),
        sqlite_column!("body", &SqlType::Text, non_null = true),
        sqlite_column!("active", &SqlType::Integer, non_null = true, default_value = Some("1")),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["trigger_name", "channel"]],
};

const USER_DIRECTORY_TABLE_V1: Table = Table {
    name: "user_directory",
    columns: &[
        sqlite_column!("username", &SqlType::Text, is_primary_key = true),
        sqlite_column!("display_name", &SqlType::Text),
        sqlite_column!("first_name", &SqlType::Text),
        sqlite_column!("location", &SqlType::Text),
        sqlite_column!("age", &SqlType::Integer),
        sqlite_column!("email", &SqlType::Text),
        sqlite_column!("phone", &SqlType::Text),
        sqlite_column!("push_token", &SqlType::Text),
        sqlite_column!("verified", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

pub const NOTIFICATION_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        NOTIFICATION_PREFERENCES_TABLE_V1,
        NOTIFICATION_SETTINGS_TABLE_V1,
        ADMIN_OVERRIDES_TABLE_V1,
        ADMIN_AUDIT_LOG_TABLE_V1,
        NOTIFICATION_QUEUE_TABLE_V1,
        NOTIFICATION_LOG_TABLE_V1,
        NOTIFICATION_TEMPLATES_TABLE_V1,
        USER_DIRECTORY_TABLE_V1,
    ],
    migration: None,
}];
