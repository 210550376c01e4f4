use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::models::{
    Channel, LogFilter, NewQueueEntry, NotificationLogEntry, NotificationQueueEntry,
    NotificationTrigger, QueueFilter, QueueStats, QueueStatus,
};
use super::overrides::{AdminAction, AdminAuditEntry, AdminOverride, OverrideTarget};
use super::preferences::{NotificationSettings, TriggerPreference};

/// Subject/body template for one (trigger, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub trigger: NotificationTrigger,
    pub channel: Channel,
    pub subject: String,
    pub body: String,
    pub active: bool,
}

/// Per-channel send cap checked inside the enqueue transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCap {
    pub channel: Channel,
    pub max: u32,
    /// Start of the counting window.
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueWrite {
    /// Ids of the inserted rows plus the channels dropped by their cap.
    Inserted {
        ids: Vec<i64>,
        capped: Vec<Channel>,
    },
    Duplicate,
    /// Every channel was at its cap. Nothing was written.
    RateLimited,
}

/// Distinct notifications raised for one user over a period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCounts {
    pub profile_views: u64,
    pub favorites: u64,
    pub messages: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Persistence for preferences, overrides, the notification queue and
/// delivery history.
pub trait NotificationStore: Send + Sync {
    // Preferences and settings
    /// Creates settings and preferences for a new user. Existing rows are
    /// kept. Returns true if the user had no settings yet.
    fn register_user(
        &self,
        settings: &NotificationSettings,
        preferences: &[TriggerPreference],
    ) -> Result<bool>;
    fn list_usernames(&self) -> Result<Vec<String>>;
    fn get_settings(&self, username: &str) -> Result<Option<NotificationSettings>>;
    fn save_settings(&self, settings: &NotificationSettings) -> Result<()>;
    fn get_preferences(&self, username: &str) -> Result<Vec<TriggerPreference>>;
    fn get_preference(
        &self,
        username: &str,
        trigger: NotificationTrigger,
    ) -> Result<Option<TriggerPreference>>;
    fn save_preference(&self, username: &str, preference: &TriggerPreference) -> Result<()>;
    /// Inserts `defaults` for every registered user lacking an entry.
    /// Returns the number of rows inserted.
    fn backfill_missing_preferences(&self, defaults: &[TriggerPreference]) -> Result<usize>;

    // Admin overrides and audit
    fn get_override(&self, target: &OverrideTarget) -> Result<Option<AdminOverride>>;
    fn save_override(&self, admin_override: &AdminOverride) -> Result<()>;
    fn delete_override(&self, target: &OverrideTarget) -> Result<bool>;
    fn list_overrides(&self) -> Result<Vec<AdminOverride>>;
    fn append_audit(
        &self,
        action: AdminAction,
        target: &OverrideTarget,
        actor: &str,
        reason: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<i64>;
    fn list_audit(&self, limit: usize, offset: usize) -> Result<Vec<AdminAuditEntry>>;

    // Queue
    /// Inserts `entries` unless a pending or processing entry with the same
    /// (username, trigger, dedup key) was created at or after `dedup_since`.
    /// Entries whose channel already reached its cap are then left out.
    /// The duplicate check, the cap counts and the inserts share one
    /// transaction.
    fn enqueue_capped(
        &self,
        entries: &[NewQueueEntry],
        dedup_since: DateTime<Utc>,
        caps: &[RateCap],
    ) -> Result<EnqueueWrite>;

    /// Uncapped enqueue. Returns None for a duplicate.
    fn enqueue_entries(
        &self,
        entries: &[NewQueueEntry],
        dedup_since: DateTime<Utc>,
    ) -> Result<Option<Vec<i64>>> {
        match self.enqueue_capped(entries, dedup_since, &[])? {
            EnqueueWrite::Inserted { ids, .. } => Ok(Some(ids)),
            EnqueueWrite::Duplicate | EnqueueWrite::RateLimited => Ok(None),
        }
    }
    /// Moves up to `limit` due pending entries of `channel` to processing and
    /// returns the ones this caller won.
    fn claim_pending(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationQueueEntry>>;
    fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<bool>;
    /// Counts a failed attempt on a processing entry. Below `max_attempts` it
    /// returns to pending, scheduled for `retry_at`; otherwise it fails.
    /// Returns the new status, or None if the entry was not processing.
    fn record_failed_attempt(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<QueueStatus>>;
    /// Fails pending entries from `actor` to `username` for `triggers`,
    /// passing through processing. Returns the number cancelled.
    fn cancel_pending(
        &self,
        username: &str,
        triggers: &[NotificationTrigger],
        actor: &str,
    ) -> Result<usize>;
    /// Returns entries stuck in processing since before `stale_before` to
    /// pending, or fails them once `max_attempts` is reached.
    fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<ReconcileReport>;
    fn get_queue_entry(&self, id: i64) -> Result<Option<NotificationQueueEntry>>;
    fn list_queue(&self, filter: &QueueFilter) -> Result<Vec<NotificationQueueEntry>>;
    /// Whether any entry, in any status, carries this dedup key.
    fn dedup_key_used(
        &self,
        username: &str,
        trigger: NotificationTrigger,
        dedup_key: &str,
    ) -> Result<bool>;
    /// Per-user activity created in `[since, until)`. Fan-out copies of one
    /// notification count once. Users without activity are absent.
    fn activity_counts(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<HashMap<String, ActivityCounts>>;
    fn queue_stats(&self) -> Result<QueueStats>;

    // Delivery log
    fn append_log(&self, entry: &NotificationLogEntry) -> Result<i64>;
    fn list_log(&self, filter: &LogFilter) -> Result<Vec<NotificationLogEntry>>;
    fn cleanup_log_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // Message templates
    fn get_active_template(
        &self,
        trigger: NotificationTrigger,
        channel: Channel,
    ) -> Result<Option<MessageTemplate>>;
    fn save_template(&self, template: &MessageTemplate) -> Result<()>;
}
