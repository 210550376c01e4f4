use super::directory::{UserDirectory, UserProfile};
use super::models::{
    Channel, ChannelStats, LogFilter, NewQueueEntry, NotificationLogEntry,
    NotificationQueueEntry, NotificationTrigger, Priority, QueueFilter, QueueStats, QueueStatus,
};
use super::overrides::{AdminAction, AdminAuditEntry, AdminOverride, OverrideFields, OverrideTarget};
use super::preferences::{Frequency, NotificationSettings, TriggerPreference};
use super::schema::NOTIFICATION_VERSIONED_SCHEMAS;
use super::store::{
    ActivityCounts, EnqueueWrite, MessageTemplate, NotificationStore, RateCap, ReconcileReport,
};
use crate::sqlite_persistence::{format_datetime, open_in_memory, open_versioned_db, parse_datetime};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const DEFAULT_LIST_LIMIT: usize = 100;

const QUEUE_COLUMNS: &str = "id, username, trigger_name, channel, template_data, priority, status, \
    scheduled_for, created_at, claimed_at, sent_at, attempts, last_error, dedup_key, actor";

const LOG_COLUMNS: &str = "id, queue_entry_id, username, trigger_name, channel, priority, status, \
    subject, preview, error, is_test, created_at";

const OVERRIDE_COLUMNS: &str =
    "target, disabled, channels, time, frequency, day_of_week, reason, overridden_by, overridden_at";

pub struct SqliteNotificationStore {
    conn: Arc<Mutex<Connection>>,
}

fn invalid_value(column: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        Type::Text,
        format!("invalid {} '{}'", what, value).into(),
    )
}

fn get_trigger(row: &rusqlite::Row, column: &str) -> rusqlite::Result<NotificationTrigger> {
    let raw: String = row.get(column)?;
    NotificationTrigger::parse(&raw).ok_or_else(|| invalid_value(0, "trigger", &raw))
}

fn get_channel(row: &rusqlite::Row, column: &str) -> rusqlite::Result<Channel> {
    let raw: String = row.get(column)?;
    Channel::parse(&raw).ok_or_else(|| invalid_value(0, "channel", &raw))
}

fn get_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    column: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
    })
}

fn get_datetime(row: &rusqlite::Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(column)?
        .and_then(|s| parse_datetime(&s)))
}

impl SqliteNotificationStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path, NOTIFICATION_VERSIONED_SCHEMAS, "notifications")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(NOTIFICATION_VERSIONED_SCHEMAS)?)),
        })
    }

    fn row_to_preference(row: &rusqlite::Row) -> rusqlite::Result<TriggerPreference> {
        let frequency: String = row.get("frequency")?;
        Ok(TriggerPreference {
            trigger: get_trigger(row, "trigger_name")?,
            channels: get_json(row, "channels")?,
            frequency: Frequency::parse(&frequency)
                .ok_or_else(|| invalid_value(0, "frequency", &frequency))?,
            time: row.get("time")?,
            day_of_week: row.get("day_of_week")?,
        })
    }

    fn row_to_settings(row: &rusqlite::Row) -> rusqlite::Result<NotificationSettings> {
        Ok(NotificationSettings {
            username: row.get("username")?,
            timezone: row.get("timezone")?,
            quiet_hours: get_json(row, "quiet_hours")?,
            rate_limits: get_json(row, "rate_limits")?,
        })
    }

    fn row_to_override(row: &rusqlite::Row) -> rusqlite::Result<AdminOverride> {
        let channels: Option<String> = row.get("channels")?;
        let frequency: Option<String> = row.get("frequency")?;
        Ok(AdminOverride {
            target: get_json(row, "target")?,
            disabled: row.get::<_, i64>("disabled")? != 0,
            fields: OverrideFields {
                channels: channels.and_then(|c| serde_json::from_str(&c).ok()),
                time: row.get("time")?,
                frequency: frequency.as_deref().and_then(Frequency::parse),
                day_of_week: row.get("day_of_week")?,
            },
            reason: row.get("reason")?,
            overridden_by: row.get("overridden_by")?,
            overridden_at: get_datetime(row, "overridden_at")?.unwrap_or_else(Utc::now),
        })
    }

    fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AdminAuditEntry> {
        let action: String = row.get("action")?;
        let details: Option<String> = row.get("details")?;
        Ok(AdminAuditEntry {
            id: row.get("id")?,
            action: AdminAction::parse(&action).ok_or_else(|| invalid_value(1, "action", &action))?,
            target_type: row.get("target_type")?,
            target_key: row.get("target_key")?,
            actor: row.get("actor")?,
            reason: row.get("reason")?,
            details: details
                .and_then(|d| serde_json::from_str(&d).ok())
                .unwrap_or(serde_json::Value::Null),
            created_at: get_datetime(row, "created_at")?.unwrap_or_else(Utc::now),
        })
    }

    fn row_to_queue_entry(row: &rusqlite::Row) -> rusqlite::Result<NotificationQueueEntry> {
        let priority: String = row.get("priority")?;
        let status: String = row.get("status")?;
        Ok(NotificationQueueEntry {
            id: row.get("id")?,
            username: row.get("username")?,
            trigger: get_trigger(row, "trigger_name")?,
            channel: get_channel(row, "channel")?,
            template_data: get_json(row, "template_data")?,
            priority: Priority::parse(&priority)
                .ok_or_else(|| invalid_value(5, "priority", &priority))?,
            status: QueueStatus::parse(&status).ok_or_else(|| invalid_value(6, "status", &status))?,
            scheduled_for: get_datetime(row, "scheduled_for")?,
            created_at: get_datetime(row, "created_at")?.unwrap_or_else(Utc::now),
            claimed_at: get_datetime(row, "claimed_at")?,
            sent_at: get_datetime(row, "sent_at")?,
            attempts: row.get::<_, i64>("attempts")? as u32,
            last_error: row.get("last_error")?,
            dedup_key: row.get("dedup_key")?,
            actor: row.get("actor")?,
        })
    }

    fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<NotificationLogEntry> {
        let priority: String = row.get("priority")?;
        Ok(NotificationLogEntry {
            id: row.get("id")?,
            queue_entry_id: row.get("queue_entry_id")?,
            username: row.get("username")?,
            trigger: get_trigger(row, "trigger_name")?,
            channel: get_channel(row, "channel")?,
            priority: Priority::parse(&priority)
                .ok_or_else(|| invalid_value(5, "priority", &priority))?,
            status: row.get("status")?,
            subject: row.get("subject")?,
            preview: row.get("preview")?,
            error: row.get("error")?,
            is_test: row.get::<_, i64>("is_test")? != 0,
            created_at: get_datetime(row, "created_at")?.unwrap_or_else(Utc::now),
        })
    }

    fn row_to_profile(row: &rusqlite::Row) -> rusqlite::Result<UserProfile> {
        Ok(UserProfile {
            username: row.get("username")?,
            display_name: row.get("display_name")?,
            first_name: row.get("first_name")?,
            location: row.get("location")?,
            age: row.get::<_, Option<i64>>("age")?.map(|a| a as u32),
            email: row.get("email")?,
            phone: row.get("phone")?,
            push_token: row.get("push_token")?,
            verified: row.get::<_, i64>("verified")? != 0,
        })
    }

    fn insert_preference(
        conn: &Connection,
        username: &str,
        pref: &TriggerPreference,
        replace: bool,
    ) -> Result<usize> {
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
        let rows = conn.execute(
            &format!(
                "{} INTO notification_preferences \
                 (username, trigger_name, channels, frequency, time, day_of_week, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                verb
            ),
            params![
                username,
                pref.trigger.as_str(),
                serde_json::to_string(&pref.channels)?,
                pref.frequency.as_str(),
                pref.time,
                pref.day_of_week,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(rows)
    }
}

/// Non-failed entries for (username, channel) created since `since`.
fn count_recent(
    conn: &Connection,
    username: &str,
    channel: Channel,
    since: DateTime<Utc>,
) -> rusqlite::Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notification_queue \
         WHERE username = ?1 AND channel = ?2 AND created_at >= ?3 AND status != 'failed'",
        params![username, channel.as_str(), format_datetime(&since)],
        |r| r.get(0),
    )?;
    Ok(count as u32)
}

impl NotificationStore for SqliteNotificationStore {
    fn register_user(
        &self,
        settings: &NotificationSettings,
        preferences: &[TriggerPreference],
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let created = tx.execute(
            "INSERT OR IGNORE INTO notification_settings \
             (username, timezone, quiet_hours, rate_limits, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                settings.username,
                settings.timezone,
                serde_json::to_string(&settings.quiet_hours)?,
                serde_json::to_string(&settings.rate_limits)?,
                format_datetime(&Utc::now()),
            ],
        )? == 1;
        for pref in preferences {
            Self::insert_preference(&tx, &settings.username, pref, false)?;
        }
        tx.commit()?;
        Ok(created)
    }

    fn list_usernames(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT username FROM notification_settings ORDER BY username")?;
        let names = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn get_settings(&self, username: &str) -> Result<Option<NotificationSettings>> {
        let conn = self.conn.lock().unwrap();
        let settings = conn
            .query_row(
                "SELECT username, timezone, quiet_hours, rate_limits FROM notification_settings \
                 WHERE username = ?1",
                params![username],
                Self::row_to_settings,
            )
            .optional()?;
        Ok(settings)
    }

    fn save_settings(&self, settings: &NotificationSettings) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notification_settings (username, timezone, quiet_hours, rate_limits, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(username) DO UPDATE SET timezone = excluded.timezone, \
             quiet_hours = excluded.quiet_hours, rate_limits = excluded.rate_limits",
            params![
                settings.username,
                settings.timezone,
                serde_json::to_string(&settings.quiet_hours)?,
                serde_json::to_string(&settings.rate_limits)?,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn get_preferences(&self, username: &str) -> Result<Vec<TriggerPreference>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT trigger_name, channels, frequency, time, day_of_week \
             FROM notification_preferences WHERE username = ?1 ORDER BY trigger_name",
        )?;
        let prefs = stmt
            .query_map(params![username], Self::row_to_preference)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(prefs)
    }

    fn get_preference(
        &self,
        username: &str,
        trigger: NotificationTrigger,
    ) -> Result<Option<TriggerPreference>> {
        let conn = self.conn.lock().unwrap();
        let pref = conn
            .query_row(
                "SELECT trigger_name, channels, frequency, time, day_of_week \
                 FROM notification_preferences WHERE username = ?1 AND trigger_name = ?2",
                params![username, trigger.as_str()],
                Self::row_to_preference,
            )
            .optional()?;
        Ok(pref)
    }

    fn save_preference(&self, username: &str, preference: &TriggerPreference) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::insert_preference(&conn, username, preference, true)?;
        Ok(())
    }

    fn backfill_missing_preferences(&self, defaults: &[TriggerPreference]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for pref in defaults {
            inserted += tx.execute(
                "INSERT INTO notification_preferences \
                 (username, trigger_name, channels, frequency, time, day_of_week, updated_at) \
                 SELECT s.username, ?1, ?2, ?3, ?4, ?5, ?6 FROM notification_settings s \
                 WHERE NOT EXISTS (SELECT 1 FROM notification_preferences p \
                                   WHERE p.username = s.username AND p.trigger_name = ?1)",
                params![
                    pref.trigger.as_str(),
                    serde_json::to_string(&pref.channels)?,
                    pref.frequency.as_str(),
                    pref.time,
                    pref.day_of_week,
                    format_datetime(&Utc::now()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn get_override(&self, target: &OverrideTarget) -> Result<Option<AdminOverride>> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                &format!(
                    "SELECT {} FROM admin_overrides WHERE target_type = ?1 AND target_key = ?2",
                    OVERRIDE_COLUMNS
                ),
                params![target.kind(), target.key()],
                Self::row_to_override,
            )
            .optional()?;
        Ok(found)
    }

    fn save_override(&self, ov: &AdminOverride) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let channels = ov
            .fields
            .channels
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO admin_overrides (target_type, target_key, target, disabled, channels, time, \
             frequency, day_of_week, reason, overridden_by, overridden_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(target_type, target_key) DO UPDATE SET disabled = excluded.disabled, \
             channels = excluded.channels, time = excluded.time, frequency = excluded.frequency, \
             day_of_week = excluded.day_of_week, reason = excluded.reason, \
             overridden_by = excluded.overridden_by, overridden_at = excluded.overridden_at",
            params![
                ov.target.kind(),
                ov.target.key(),
                serde_json::to_string(&ov.target)?,
                ov.disabled as i64,
                channels,
                ov.fields.time,
                ov.fields.frequency.map(|f| f.as_str()),
                ov.fields.day_of_week,
                ov.reason,
                ov.overridden_by,
                format_datetime(&ov.overridden_at),
            ],
        )
        .context("Failed to save admin override")?;
        Ok(())
    }

    fn delete_override(&self, target: &OverrideTarget) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM admin_overrides WHERE target_type = ?1 AND target_key = ?2",
            params![target.kind(), target.key()],
        )?;
        Ok(rows > 0)
    }

    fn list_overrides(&self) -> Result<Vec<AdminOverride>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM admin_overrides ORDER BY overridden_at DESC",
            OVERRIDE_COLUMNS
        ))?;
        let overrides = stmt
            .query_map([], Self::row_to_override)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(overrides)
    }

    fn append_audit(
        &self,
        action: AdminAction,
        target: &OverrideTarget,
        actor: &str,
        reason: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO admin_audit_log (action, target_type, target_key, actor, reason, details, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                action.as_str(),
                target.kind(),
                target.key(),
                actor,
                reason,
                details.to_string(),
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_audit(&self, limit: usize, offset: usize) -> Result<Vec<AdminAuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, action, target_type, target_key, actor, reason, details, created_at \
             FROM admin_audit_log ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let entries = stmt
            .query_map(params![limit as i64, offset as i64], Self::row_to_audit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn enqueue_capped(
        &self,
        entries: &[NewQueueEntry],
        dedup_since: DateTime<Utc>,
        caps: &[RateCap],
    ) -> Result<EnqueueWrite> {
        let first = match entries.first() {
            Some(first) => first,
            None => {
                return Ok(EnqueueWrite::Inserted {
                    ids: Vec::new(),
                    capped: Vec::new(),
                })
            }
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM notification_queue \
             WHERE username = ?1 AND trigger_name = ?2 AND dedup_key = ?3 \
             AND status IN ('pending', 'processing') AND created_at >= ?4",
            params![
                first.username,
                first.trigger.as_str(),
                first.dedup_key,
                format_datetime(&dedup_since),
            ],
            |r| r.get(0),
        )?;
        if existing > 0 {
            return Ok(EnqueueWrite::Duplicate);
        }

        let mut capped = Vec::new();
        for cap in caps {
            let sent = count_recent(&tx, &first.username, cap.channel, cap.since)?;
            if sent >= cap.max {
                capped.push(cap.channel);
            }
        }
        let allowed: Vec<&NewQueueEntry> = entries
            .iter()
            .filter(|entry| !capped.contains(&entry.channel))
            .collect();
        if allowed.is_empty() {
            return Ok(EnqueueWrite::RateLimited);
        }

        let now = format_datetime(&Utc::now());
        let mut ids = Vec::with_capacity(allowed.len());
        for entry in allowed {
            tx.execute(
                "INSERT INTO notification_queue (username, trigger_name, channel, template_data, \
                 priority, priority_rank, status, scheduled_for, created_at, attempts, dedup_key, actor) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, 0, ?9, ?10)",
                params![
                    entry.username,
                    entry.trigger.as_str(),
                    entry.channel.as_str(),
                    entry.template_data.to_string(),
                    entry.priority.as_str(),
                    entry.priority.rank(),
                    entry.scheduled_for.as_ref().map(format_datetime),
                    now,
                    entry.dedup_key,
                    entry.actor,
                ],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(EnqueueWrite::Inserted { ids, capped })
    }

    fn claim_pending(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationQueueEntry>> {
        let now_str = format_datetime(&now);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM notification_queue \
                 WHERE status = 'pending' AND channel = ?1 \
                 AND (scheduled_for IS NULL OR scheduled_for <= ?2) \
                 ORDER BY priority_rank DESC, created_at, id LIMIT ?3",
            )?;
            let ids = stmt
                .query_map(params![channel.as_str(), now_str, limit as i64], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Losing a race here is not an error: zero rows means another
            // claimant got it first.
            let rows = tx.execute(
                "UPDATE notification_queue SET status = 'processing', claimed_at = ?2 \
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_str],
            )?;
            if rows == 1 {
                let entry = tx.query_row(
                    &format!("SELECT {} FROM notification_queue WHERE id = ?1", QUEUE_COLUMNS),
                    params![id],
                    Self::row_to_queue_entry,
                )?;
                claimed.push(entry);
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn mark_sent(&self, id: i64, sent_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE notification_queue SET status = 'sent', sent_at = ?2, last_error = NULL \
             WHERE id = ?1 AND status = 'processing'",
            params![id, format_datetime(&sent_at)],
        )?;
        Ok(rows == 1)
    }

    fn record_failed_attempt(
        &self,
        id: i64,
        error: &str,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<QueueStatus>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempts: Option<i64> = tx
            .query_row(
                "SELECT attempts FROM notification_queue WHERE id = ?1 AND status = 'processing'",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        let attempts = match attempts {
            Some(a) => a + 1,
            None => return Ok(None),
        };

        let status = if attempts >= max_attempts as i64 {
            tx.execute(
                "UPDATE notification_queue SET status = 'failed', attempts = ?2, last_error = ?3 \
                 WHERE id = ?1 AND status = 'processing'",
                params![id, attempts, error],
            )?;
            QueueStatus::Failed
        } else {
            tx.execute(
                "UPDATE notification_queue SET status = 'pending', attempts = ?2, last_error = ?3, \
                 scheduled_for = ?4, claimed_at = NULL WHERE id = ?1 AND status = 'processing'",
                params![id, attempts, error, format_datetime(&retry_at)],
            )?;
            QueueStatus::Pending
        };
        tx.commit()?;
        Ok(Some(status))
    }

    fn cancel_pending(
        &self,
        username: &str,
        triggers: &[NotificationTrigger],
        actor: &str,
    ) -> Result<usize> {
        let now = format_datetime(&Utc::now());
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut cancelled = 0;
        for trigger in triggers {
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM notification_queue WHERE username = ?1 AND trigger_name = ?2 \
                     AND actor = ?3 AND status = 'pending'",
                )?;
                let ids = stmt
                    .query_map(params![username, trigger.as_str(), actor], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                ids
            };
            for id in ids {
                let claimed = tx.execute(
                    "UPDATE notification_queue SET status = 'processing', claimed_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, now],
                )?;
                if claimed == 1 {
                    tx.execute(
                        "UPDATE notification_queue SET status = 'failed', last_error = 'cancelled' \
                         WHERE id = ?1 AND status = 'processing'",
                        params![id],
                    )?;
                    cancelled += 1;
                }
            }
        }
        tx.commit()?;
        Ok(cancelled)
    }

    fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<ReconcileReport> {
        let cutoff = format_datetime(&stale_before);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let failed = tx.execute(
            "UPDATE notification_queue SET status = 'failed', attempts = attempts + 1, \
             last_error = 'abandoned while processing' \
             WHERE status = 'processing' AND claimed_at < ?1 AND attempts + 1 >= ?2",
            params![cutoff, max_attempts as i64],
        )?;
        let requeued = tx.execute(
            "UPDATE notification_queue SET status = 'pending', attempts = attempts + 1, \
             claimed_at = NULL, last_error = 'abandoned while processing' \
             WHERE status = 'processing' AND claimed_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(ReconcileReport { requeued, failed })
    }

    fn get_queue_entry(&self, id: i64) -> Result<Option<NotificationQueueEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM notification_queue WHERE id = ?1", QUEUE_COLUMNS),
                params![id],
                Self::row_to_queue_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn list_queue(&self, filter: &QueueFilter) -> Result<Vec<NotificationQueueEntry>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(username) = &filter.username {
            values.push(username.clone());
            clauses.push(format!("username = ?{}", values.len()));
        }
        if let Some(channel) = filter.channel {
            values.push(channel.as_str().to_string());
            clauses.push(format!("channel = ?{}", values.len()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM notification_queue {} ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            QUEUE_COLUMNS,
            where_sql,
            filter.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            filter.offset.unwrap_or(0),
        ))?;
        let entries = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_queue_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn dedup_key_used(
        &self,
        username: &str,
        trigger: NotificationTrigger,
        dedup_key: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT 1 FROM notification_queue \
                 WHERE username = ?1 AND trigger_name = ?2 AND dedup_key = ?3 LIMIT 1",
                params![username, trigger.as_str(), dedup_key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn activity_counts(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<HashMap<String, ActivityCounts>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT username, trigger_name, COUNT(DISTINCT dedup_key) FROM notification_queue \
             WHERE created_at >= ?1 AND created_at < ?2 AND trigger_name IN (?3, ?4, ?5) \
             GROUP BY username, trigger_name",
        )?;
        let rows = stmt
            .query_map(
                params![
                    format_datetime(&since),
                    format_datetime(&until),
                    NotificationTrigger::ProfileView.as_str(),
                    NotificationTrigger::Favorited.as_str(),
                    NotificationTrigger::NewMessage.as_str(),
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        get_trigger(row, "trigger_name")?,
                        row.get::<_, i64>(2)? as u64,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts: HashMap<String, ActivityCounts> = HashMap::new();
        for (username, trigger, count) in rows {
            let user = counts.entry(username).or_default();
            match trigger {
                NotificationTrigger::ProfileView => user.profile_views = count,
                NotificationTrigger::Favorited => user.favorites = count,
                NotificationTrigger::NewMessage => user.messages = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT channel, status, COUNT(*) FROM notification_queue \
             GROUP BY channel, status ORDER BY channel, status",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = QueueStats::default();
        for (channel, status, count) in rows {
            let (Some(channel), Some(status)) = (Channel::parse(&channel), QueueStatus::parse(&status))
            else {
                continue;
            };
            let count = count as u64;
            match status {
                QueueStatus::Pending => stats.pending += count,
                QueueStatus::Processing => stats.processing += count,
                QueueStatus::Sent => stats.sent += count,
                QueueStatus::Failed => stats.failed += count,
            }
            stats.by_channel.push(ChannelStats {
                channel,
                status,
                count,
            });
        }
        Ok(stats)
    }

    fn append_log(&self, entry: &NotificationLogEntry) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notification_log (queue_entry_id, username, trigger_name, channel, priority, \
             status, subject, preview, error, is_test, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.queue_entry_id,
                entry.username,
                entry.trigger.as_str(),
                entry.channel.as_str(),
                entry.priority.as_str(),
                entry.status,
                entry.subject,
                entry.preview,
                entry.error,
                entry.is_test as i64,
                format_datetime(&entry.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_log(&self, filter: &LogFilter) -> Result<Vec<NotificationLogEntry>> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64;
        let conn = self.conn.lock().unwrap();
        let entries = match &filter.username {
            Some(username) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM notification_log WHERE username = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                    LOG_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![username, limit], Self::row_to_log)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM notification_log ORDER BY created_at DESC, id DESC LIMIT ?1",
                    LOG_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit], Self::row_to_log)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(entries)
    }

    fn cleanup_log_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "DELETE FROM notification_log WHERE created_at < ?1",
            params![format_datetime(&cutoff)],
        )?;
        Ok(rows)
    }

    fn get_active_template(
        &self,
        trigger: NotificationTrigger,
        channel: Channel,
    ) -> Result<Option<MessageTemplate>> {
        let conn = self.conn.lock().unwrap();
        let template = conn
            .query_row(
                "SELECT subject, body FROM notification_templates \
                 WHERE trigger_name = ?1 AND channel = ?2 AND active = 1",
                params![trigger.as_str(), channel.as_str()],
                |r| {
                    Ok(MessageTemplate {
                        trigger,
                        channel,
                        subject: r.get(0)?,
                        body: r.get(1)?,
                        active: true,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }

    fn save_template(&self, template: &MessageTemplate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notification_templates (trigger_name, channel, subject, body, active, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(trigger_name, channel) DO UPDATE SET subject = excluded.subject, \
             body = excluded.body, active = excluded.active, updated_at = excluded.updated_at",
            params![
                template.trigger.as_str(),
                template.channel.as_str(),
                template.subject,
                template.body,
                template.active as i64,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }
}

impl UserDirectory for SqliteNotificationStore {
    fn get_profile(&self, username: &str) -> Result<Option<UserProfile>> {
        let conn = self.conn.lock().unwrap();
        let profile = conn
            .query_row(
                "SELECT username, display_name, first_name, location, age, email, phone, \
                 push_token, verified FROM user_directory WHERE username = ?1",
                params![username],
                Self::row_to_profile,
            )
            .optional()?;
        Ok(profile)
    }

    fn upsert_profile(&self, profile: &UserProfile) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_directory (username, display_name, first_name, location, age, email, \
             phone, push_token, verified, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(username) DO UPDATE SET display_name = excluded.display_name, \
             first_name = excluded.first_name, location = excluded.location, age = excluded.age, \
             email = excluded.email, phone = excluded.phone, push_token = excluded.push_token, \
             verified = excluded.verified, updated_at = excluded.updated_at",
            params![
                profile.username,
                profile.display_name,
                profile.first_name,
                profile.location,
                profile.age.map(|a| a as i64),
                profile.email,
                profile.phone,
                profile.push_token,
                profile.verified as i64,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(())
    }
}
