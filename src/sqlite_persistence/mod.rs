mod versioned_schema;

use chrono::{DateTime, SecondsFormat, Utc};

pub use versioned_schema::{
    open_in_memory, open_versioned_db, Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION,
};

/// Fixed-width RFC3339 so stored timestamps compare correctly as text.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
