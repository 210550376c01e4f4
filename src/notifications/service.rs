//! The single decision point for whether, when and through which channels a
//! user is notified.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::models::{
    Channel, EnqueueOutcome, EnqueueRequest, NewQueueEntry, NotificationTrigger, Priority,
    RejectReason,
};
use super::overrides::OverrideTarget;
use super::preferences::{
    default_preferences, next_delivery_time, NotificationSettings, QuietHours, RateLimit,
    TriggerPreference,
};
use super::store::{EnqueueWrite, NotificationStore, RateCap};
use crate::server::metrics;

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("user {0} is not registered")]
    UnknownUser(String),
    #[error("invalid preferences: {0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPreferences {
    pub settings: NotificationSettings,
    pub preferences: Vec<TriggerPreference>,
}

/// Partial update of a user's notification preferences.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreferencesUpdate {
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub rate_limits: Option<BTreeMap<Channel, RateLimit>>,
    #[serde(default)]
    pub preferences: Vec<TriggerPreference>,
}

pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    dedup_window: Duration,
}

/// SHA-256 of the canonical JSON of `data`. Object keys serialize sorted.
pub fn content_dedup_key(data: &serde_json::Value) -> String {
    let digest = Sha256::digest(data.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>, dedup_window_secs: u64) -> Self {
        Self {
            store,
            dedup_window: Duration::seconds(dedup_window_secs as i64),
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Decides whether `request` produces queue entries and writes them.
    /// Only performs local lookups plus one atomic write.
    pub fn enqueue(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome> {
        self.enqueue_at(request, Utc::now(), true)
    }

    /// Same as `enqueue` without consulting admin overrides. Used by the
    /// admin disable action to explain itself to the affected user.
    pub fn enqueue_bypassing_overrides(&self, request: &EnqueueRequest) -> Result<EnqueueOutcome> {
        self.enqueue_at(request, Utc::now(), false)
    }

    fn enqueue_at(
        &self,
        request: &EnqueueRequest,
        now: DateTime<Utc>,
        check_overrides: bool,
    ) -> Result<EnqueueOutcome> {
        let outcome = self.decide(request, now, check_overrides)?;
        metrics::record_enqueue_outcome(request.trigger.as_str(), outcome.label());
        match &outcome {
            EnqueueOutcome::Enqueued { entry_ids } => info!(
                "Enqueued {} for {} as entries {:?}",
                request.trigger.as_str(),
                request.username,
                entry_ids
            ),
            EnqueueOutcome::Rejected { reason } => debug!(
                "Rejected {} for {}: {}",
                request.trigger.as_str(),
                request.username,
                reason.as_str()
            ),
        }
        Ok(outcome)
    }

    fn decide(
        &self,
        request: &EnqueueRequest,
        now: DateTime<Utc>,
        check_overrides: bool,
    ) -> Result<EnqueueOutcome> {
        let username = &request.username;
        let trigger = request.trigger;

        let mut overrides = Vec::new();
        if check_overrides {
            let own = OverrideTarget::TriggerPreference {
                username: username.clone(),
                trigger,
            };
            for target in std::iter::once(&own).chain(request.related_target.as_ref()) {
                if let Some(ov) = self
                    .store
                    .get_override(target)
                    .context("Failed to load admin override")?
                {
                    if ov.disabled {
                        return Ok(EnqueueOutcome::rejected(RejectReason::AdminDisabled));
                    }
                    overrides.push(ov);
                }
            }
        }

        let preference = match self
            .store
            .get_preference(username, trigger)
            .context("Failed to load notification preference")?
        {
            Some(p) => p,
            None => {
                error!(
                    "No notification preference for user {} and trigger {}; notification rejected",
                    username,
                    trigger.as_str()
                );
                metrics::record_preference_integrity_violation(trigger.as_str());
                return Ok(EnqueueOutcome::rejected(
                    RejectReason::NoPreferenceConfigured,
                ));
            }
        };
        let preference = overrides
            .iter()
            .fold(preference, |pref, ov| ov.apply_to(&pref));

        let mut channels: Vec<Channel> = Vec::new();
        for channel in &request.channels {
            if preference.channels.contains(channel) && !channels.contains(channel) {
                channels.push(*channel);
            }
        }
        if channels.is_empty() {
            return Ok(EnqueueOutcome::rejected(RejectReason::NoChannelsEnabled));
        }

        let settings = match self.store.get_settings(username)? {
            Some(s) => s,
            None => {
                warn!("No notification settings for {}, using defaults", username);
                NotificationSettings::defaults_for(username.as_str(), "UTC")
            }
        };

        let caps: Vec<RateCap> = if request.priority == Priority::Critical {
            Vec::new()
        } else {
            channels
                .iter()
                .filter_map(|channel| {
                    settings.rate_limits.get(channel).map(|limit| RateCap {
                        channel: *channel,
                        max: limit.max,
                        since: now - limit.period.window(),
                    })
                })
                .collect()
        };

        let scheduled_for = if request.priority == Priority::Critical {
            None
        } else {
            let planned = next_delivery_time(
                preference.frequency,
                preference.time.as_deref(),
                preference.day_of_week.as_deref(),
                now,
                settings.tz(),
            );
            match settings
                .quiet_hours
                .deferral(planned.unwrap_or(now), trigger)
            {
                Some(window_end) => Some(window_end),
                None => planned,
            }
        };

        let dedup_key = request
            .dedup_key
            .clone()
            .unwrap_or_else(|| content_dedup_key(&request.template_data));
        let entries: Vec<NewQueueEntry> = channels
            .iter()
            .map(|channel| NewQueueEntry {
                username: username.clone(),
                trigger,
                channel: *channel,
                template_data: request.template_data.clone(),
                priority: request.priority,
                scheduled_for,
                dedup_key: dedup_key.clone(),
                actor: request.actor.clone(),
            })
            .collect();

        match self
            .store
            .enqueue_capped(&entries, now - self.dedup_window, &caps)
            .context("Failed to write queue entries")?
        {
            EnqueueWrite::Inserted { ids, capped } => {
                for channel in capped {
                    info!(
                        "Dropping {} for {}: rate limit reached",
                        channel.as_str(),
                        username
                    );
                }
                Ok(EnqueueOutcome::Enqueued { entry_ids: ids })
            }
            EnqueueWrite::Duplicate => Ok(EnqueueOutcome::rejected(RejectReason::Duplicate)),
            EnqueueWrite::RateLimited => Ok(EnqueueOutcome::rejected(RejectReason::RateLimited)),
        }
    }

    /// Creates default settings and the full default preference map.
    /// Returns false if the user was already registered.
    pub fn register_user(&self, username: &str, timezone: Option<&str>) -> Result<bool> {
        let settings = NotificationSettings::defaults_for(username, timezone.unwrap_or("UTC"));
        let created = self
            .store
            .register_user(&settings, &default_preferences())
            .with_context(|| format!("Failed to register {} for notifications", username))?;
        if created {
            info!("Registered notification preferences for {}", username);
        }
        Ok(created)
    }

    /// Inserts default preference rows for every (user, trigger) pair missing.
    pub fn backfill_missing_triggers(&self) -> Result<usize> {
        let inserted = self
            .store
            .backfill_missing_preferences(&default_preferences())
            .context("Failed to backfill notification preferences")?;
        if inserted > 0 {
            warn!("Backfilled {} missing notification preference rows", inserted);
        } else {
            info!("Notification preferences complete for all users");
        }
        Ok(inserted)
    }

    /// Cancels pending notifications `actor` caused for `username`, e.g.
    /// after an unfavorite.
    pub fn cancel_pending_from_actor(
        &self,
        username: &str,
        triggers: &[NotificationTrigger],
        actor: &str,
    ) -> Result<usize> {
        let cancelled = self.store.cancel_pending(username, triggers, actor)?;
        if cancelled > 0 {
            info!(
                "Cancelled {} pending notifications from {} to {}",
                cancelled, actor, username
            );
        }
        Ok(cancelled)
    }

    pub fn get_user_preferences(&self, username: &str) -> Result<Option<UserPreferences>> {
        let settings = match self.store.get_settings(username)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let preferences = self.store.get_preferences(username)?;
        Ok(Some(UserPreferences {
            settings,
            preferences,
        }))
    }

    pub fn update_user_preferences(
        &self,
        username: &str,
        update: PreferencesUpdate,
    ) -> Result<UserPreferences, PreferenceError> {
        let mut settings = self
            .store
            .get_settings(username)?
            .ok_or_else(|| PreferenceError::UnknownUser(username.to_string()))?;

        if let Some(timezone) = update.timezone {
            timezone
                .parse::<chrono_tz::Tz>()
                .map_err(|_| PreferenceError::Invalid(format!("invalid timezone '{}'", timezone)))?;
            settings.timezone = timezone;
        }
        if let Some(quiet_hours) = update.quiet_hours {
            quiet_hours.validate().map_err(PreferenceError::Invalid)?;
            settings.quiet_hours = quiet_hours;
        }
        if let Some(rate_limits) = update.rate_limits {
            settings.rate_limits = rate_limits;
        }
        for pref in &update.preferences {
            pref.validate().map_err(PreferenceError::Invalid)?;
        }

        self.store.save_settings(&settings)?;
        for pref in &update.preferences {
            self.store.save_preference(username, pref)?;
        }
        Ok(UserPreferences {
            preferences: self.store.get_preferences(username)?,
            settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::models::{QueueFilter, QueueStatus};
    use crate::notifications::overrides::AdminOverride;
    use crate::notifications::preferences::{Frequency, RatePeriod};
    use crate::notifications::sqlite_store::SqliteNotificationStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn setup() -> (Arc<SqliteNotificationStore>, NotificationService) {
        let store = Arc::new(SqliteNotificationStore::in_memory().unwrap());
        let service = NotificationService::new(store.clone(), 3600);
        (store, service)
    }

    /// Registers a user whose notifications are never deferred by quiet hours.
    fn register(store: &SqliteNotificationStore, service: &NotificationService, username: &str) {
        service.register_user(username, None).unwrap();
        let mut settings = store.get_settings(username).unwrap().unwrap();
        settings.quiet_hours.enabled = false;
        store.save_settings(&settings).unwrap();
    }

    fn favorited(username: &str) -> EnqueueRequest {
        EnqueueRequest::new(username, NotificationTrigger::Favorited, &[Channel::Email])
            .with_data(json!({"actor": "bob"}))
            .from_actor("bob")
    }

    #[test]
    fn test_happy_path_enqueues_pending_entry() {
        let (store, service) = setup();
        register(&store, &service, "alice");

        let outcome = service.enqueue(&favorited("alice")).unwrap();
        let ids = outcome.entry_ids().to_vec();
        assert_eq!(ids.len(), 1);

        let entry = store.get_queue_entry(ids[0]).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.trigger, NotificationTrigger::Favorited);
        assert_eq!(entry.channel, Channel::Email);
        assert!(entry.scheduled_for.is_none());
    }

    #[test]
    fn test_fan_out_one_entry_per_channel() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let request = EnqueueRequest::new(
            "alice",
            NotificationTrigger::NewMatch,
            &[Channel::Email, Channel::Push, Channel::Sms],
        );
        // new_match defaults to email and push; sms is not enabled.
        let outcome = service.enqueue(&request).unwrap();
        assert_eq!(outcome.entry_ids().len(), 2);
    }

    #[test]
    fn test_missing_preference_is_explicit_rejection() {
        let (store, service) = setup();
        store
            .register_user(&NotificationSettings::defaults_for("alice", "UTC"), &[])
            .unwrap();

        let outcome = service.enqueue(&favorited("alice")).unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::rejected(RejectReason::NoPreferenceConfigured)
        );
        assert!(store.list_queue(&QueueFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_empty_channel_set_is_opt_out() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let request =
            EnqueueRequest::new("alice", NotificationTrigger::MessageRead, &[Channel::Email]);
        assert_eq!(
            service.enqueue(&request).unwrap(),
            EnqueueOutcome::rejected(RejectReason::NoChannelsEnabled)
        );
    }

    #[test]
    fn test_admin_disabled_always_rejects() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let target = OverrideTarget::TriggerPreference {
            username: "alice".to_string(),
            trigger: NotificationTrigger::Favorited,
        };
        let mut ov = AdminOverride::new(target, "root");
        ov.disabled = true;
        store.save_override(&ov).unwrap();

        for channels in [vec![Channel::Email], vec![Channel::Email, Channel::Push]] {
            let request = EnqueueRequest::new("alice", NotificationTrigger::Favorited, &channels);
            assert_eq!(
                service.enqueue(&request).unwrap(),
                EnqueueOutcome::rejected(RejectReason::AdminDisabled)
            );
        }
        assert!(service
            .enqueue_bypassing_overrides(&favorited("alice"))
            .unwrap()
            .entry_ids()
            .len()
            == 1);
    }

    #[test]
    fn test_disabled_saved_search_suppresses_matches() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let search = OverrideTarget::SavedSearch {
            username: "alice".to_string(),
            search_id: "s1".to_string(),
        };
        let mut ov = AdminOverride::new(search.clone(), "root");
        ov.disabled = true;
        store.save_override(&ov).unwrap();

        let request =
            EnqueueRequest::new("alice", NotificationTrigger::NewUsersMatching, &[Channel::Email]);
        assert_eq!(
            service.enqueue(&request.clone().related_to(search)).unwrap(),
            EnqueueOutcome::rejected(RejectReason::AdminDisabled)
        );
        let other = OverrideTarget::SavedSearch {
            username: "alice".to_string(),
            search_id: "s2".to_string(),
        };
        assert!(matches!(
            service.enqueue(&request.related_to(other)).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
    }

    #[test]
    fn test_override_channels_replace_preference() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let target = OverrideTarget::TriggerPreference {
            username: "alice".to_string(),
            trigger: NotificationTrigger::Favorited,
        };
        let mut ov = AdminOverride::new(target, "root");
        ov.fields.channels = Some(vec![Channel::Sms]);
        store.save_override(&ov).unwrap();

        assert_eq!(
            service.enqueue(&favorited("alice")).unwrap(),
            EnqueueOutcome::rejected(RejectReason::NoChannelsEnabled)
        );
        let sms = EnqueueRequest::new("alice", NotificationTrigger::Favorited, &[Channel::Sms]);
        assert_eq!(service.enqueue(&sms).unwrap().entry_ids().len(), 1);
        // The stored preference is untouched.
        let pref = store
            .get_preference("alice", NotificationTrigger::Favorited)
            .unwrap()
            .unwrap();
        assert_eq!(pref.channels, vec![Channel::Email, Channel::Push]);
    }

    #[test]
    fn test_dedup_idempotence() {
        let (store, service) = setup();
        register(&store, &service, "alice");

        let first = service.enqueue(&favorited("alice")).unwrap();
        let second = service.enqueue(&favorited("alice")).unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued { .. }));
        assert_eq!(second, EnqueueOutcome::rejected(RejectReason::Duplicate));
        assert_eq!(store.list_queue(&QueueFilter::default()).unwrap().len(), 1);

        let explicit = favorited("alice").with_dedup_key("favorite:bob:2");
        assert!(matches!(
            service.enqueue(&explicit).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
    }

    #[test]
    fn test_content_dedup_key_ignores_key_order() {
        let a = json!({"actor": "bob", "n": 1});
        let b: serde_json::Value = serde_json::from_str(r#"{"n":1,"actor":"bob"}"#).unwrap();
        assert_eq!(content_dedup_key(&a), content_dedup_key(&b));
        assert_eq!(content_dedup_key(&a).len(), 64);
        assert_ne!(content_dedup_key(&a), content_dedup_key(&json!({})));
    }

    #[test]
    fn test_rate_limit_drops_channel_and_critical_bypasses() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let mut settings = store.get_settings("alice").unwrap().unwrap();
        settings.rate_limits.insert(
            Channel::Sms,
            RateLimit {
                max: 1,
                period: RatePeriod::Daily,
            },
        );
        store.save_settings(&settings).unwrap();

        let login = |n: u32| {
            EnqueueRequest::new("alice", NotificationTrigger::PiiRequest, &[Channel::Sms])
                .with_dedup_key(format!("req-{}", n))
        };
        assert!(matches!(
            service.enqueue(&login(1)).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
        assert_eq!(
            service.enqueue(&login(2)).unwrap(),
            EnqueueOutcome::rejected(RejectReason::RateLimited)
        );
        assert!(matches!(
            service
                .enqueue(&login(3).with_priority(Priority::Critical))
                .unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
    }

    #[test]
    fn test_repeat_at_rate_limit_is_reported_as_duplicate() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let mut settings = store.get_settings("alice").unwrap().unwrap();
        settings.rate_limits.insert(
            Channel::Email,
            RateLimit {
                max: 1,
                period: RatePeriod::Hourly,
            },
        );
        store.save_settings(&settings).unwrap();

        assert!(matches!(
            service.enqueue(&favorited("alice")).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));
        assert_eq!(
            service.enqueue(&favorited("alice")).unwrap(),
            EnqueueOutcome::rejected(RejectReason::Duplicate)
        );
        assert_eq!(
            service
                .enqueue(&favorited("alice").with_dedup_key("favorite:bob:2"))
                .unwrap(),
            EnqueueOutcome::rejected(RejectReason::RateLimited)
        );
        assert_eq!(store.list_queue(&QueueFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_weekly_preference_schedules_delivery() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();

        let request =
            EnqueueRequest::new("alice", NotificationTrigger::WeeklyDigest, &[Channel::Email]);
        let outcome = service.enqueue_at(&request, now, true).unwrap();
        let entry = store
            .get_queue_entry(outcome.entry_ids()[0])
            .unwrap()
            .unwrap();
        // Default weekly digest: Monday 09:00, already past this week.
        assert_eq!(
            entry.scheduled_for,
            Some(Utc.with_ymd_and_hms(2024, 1, 22, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_quiet_hours_defer_unless_exception_or_critical() {
        let (store, service) = setup();
        service.register_user("alice", None).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 1, 15, 23, 30, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap();

        let outcome = service.enqueue_at(&favorited("alice"), night, true).unwrap();
        let entry = store.get_queue_entry(outcome.entry_ids()[0]).unwrap().unwrap();
        assert_eq!(entry.scheduled_for, Some(morning));

        let exception =
            EnqueueRequest::new("alice", NotificationTrigger::SuspiciousLogin, &[Channel::Email]);
        let outcome = service.enqueue_at(&exception, night, true).unwrap();
        let entry = store.get_queue_entry(outcome.entry_ids()[0]).unwrap().unwrap();
        assert!(entry.scheduled_for.is_none());

        let critical = EnqueueRequest::new("alice", NotificationTrigger::AccountStatus, &[Channel::Email])
            .with_priority(Priority::Critical);
        let outcome = service.enqueue_at(&critical, night, true).unwrap();
        let entry = store.get_queue_entry(outcome.entry_ids()[0]).unwrap().unwrap();
        assert!(entry.scheduled_for.is_none());
    }

    #[test]
    fn test_preference_completeness_after_register_and_backfill() {
        let (store, service) = setup();
        service.register_user("alice", None).unwrap();
        store
            .register_user(&NotificationSettings::defaults_for("legacy", "UTC"), &[])
            .unwrap();

        assert_eq!(
            service.backfill_missing_triggers().unwrap(),
            NotificationTrigger::ALL.len()
        );
        for user in ["alice", "legacy"] {
            for trigger in NotificationTrigger::ALL {
                assert!(
                    store.get_preference(user, *trigger).unwrap().is_some(),
                    "{} lacks {}",
                    user,
                    trigger.as_str()
                );
            }
        }
    }

    #[test]
    fn test_cancel_pending_from_actor() {
        let (store, service) = setup();
        register(&store, &service, "alice");
        let id = service.enqueue(&favorited("alice")).unwrap().entry_ids()[0];

        let cancelled = service
            .cancel_pending_from_actor("alice", &[NotificationTrigger::Favorited], "bob")
            .unwrap();
        assert_eq!(cancelled, 1);
        let entry = store.get_queue_entry(id).unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
    }

    #[test]
    fn test_update_preferences_validates() {
        let (store, service) = setup();
        register(&store, &service, "alice");

        let bad = PreferencesUpdate {
            timezone: Some("Nowhere/City".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            service.update_user_preferences("alice", bad),
            Err(PreferenceError::Invalid(_))
        ));
        assert!(matches!(
            service.update_user_preferences("ghost", PreferencesUpdate::default()),
            Err(PreferenceError::UnknownUser(_))
        ));

        let update = PreferencesUpdate {
            timezone: Some("Europe/Rome".to_string()),
            preferences: vec![TriggerPreference {
                trigger: NotificationTrigger::ProfileView,
                channels: vec![],
                frequency: Frequency::Daily,
                time: Some("18:00".to_string()),
                day_of_week: None,
            }],
            ..Default::default()
        };
        let updated = service.update_user_preferences("alice", update).unwrap();
        assert_eq!(updated.settings.timezone, "Europe/Rome");
        let view = updated
            .preferences
            .iter()
            .find(|p| p.trigger == NotificationTrigger::ProfileView)
            .unwrap();
        assert!(view.channels.is_empty());
    }
}
