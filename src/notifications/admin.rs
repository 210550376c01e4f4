//! Admin override, disable, enable and test actions. Every action is
//! recorded in the admin audit log.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use super::delivery::{DeliveryPipeline, TestDeliveryReport, TestMessage};
use super::models::{Channel, EnqueueOutcome, EnqueueRequest, NotificationTrigger, Priority};
use super::overrides::{AdminAction, AdminAuditEntry, AdminOverride, OverrideFields, OverrideTarget};
use super::service::NotificationService;
use super::store::NotificationStore;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct DisableOutcome {
    #[serde(rename = "override")]
    pub admin_override: AdminOverride,
    /// Result of the explanatory notification, when one was requested.
    pub notification: Option<EnqueueOutcome>,
}

pub struct AdminOverrideManager {
    store: Arc<dyn NotificationStore>,
    service: Arc<NotificationService>,
    delivery: Arc<DeliveryPipeline>,
}

impl AdminOverrideManager {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        service: Arc<NotificationService>,
        delivery: Arc<DeliveryPipeline>,
    ) -> Self {
        Self {
            store,
            service,
            delivery,
        }
    }

    fn ensure_target_exists(&self, target: &OverrideTarget) -> Result<(), AdminError> {
        if target.username().is_empty() {
            return Err(AdminError::Validation("target username is required".to_string()));
        }
        if self.store.get_settings(target.username())?.is_none() {
            return Err(AdminError::NotFound(format!("user {}", target.username())));
        }
        Ok(())
    }

    /// Merges `fields` into the target's override. The user's own preference
    /// is left as is.
    pub fn override_target(
        &self,
        target: &OverrideTarget,
        fields: &OverrideFields,
        reason: Option<String>,
        actor: &str,
    ) -> Result<AdminOverride, AdminError> {
        fields.validate().map_err(AdminError::Validation)?;
        self.ensure_target_exists(target)?;

        let mut admin_override = self
            .store
            .get_override(target)?
            .unwrap_or_else(|| AdminOverride::new(target.clone(), actor));
        admin_override.merge(fields, reason.clone(), actor);
        self.store.save_override(&admin_override)?;
        self.store.append_audit(
            AdminAction::Override,
            target,
            actor,
            reason.as_deref(),
            &json!({ "fields": fields }),
        )?;

        info!("{} overrode notifications for {}", actor, target.key());
        Ok(admin_override)
    }

    pub fn disable(
        &self,
        target: &OverrideTarget,
        reason: Option<String>,
        notify_user: bool,
        actor: &str,
    ) -> Result<DisableOutcome, AdminError> {
        self.ensure_target_exists(target)?;

        let mut admin_override = self
            .store
            .get_override(target)?
            .unwrap_or_else(|| AdminOverride::new(target.clone(), actor));
        admin_override.disabled = true;
        if reason.is_some() {
            admin_override.reason = reason.clone();
        }
        admin_override.overridden_by = actor.to_string();
        admin_override.overridden_at = Utc::now();
        self.store.save_override(&admin_override)?;

        let notification = if notify_user {
            Some(self.notify_disabled(target, reason.as_deref())?)
        } else {
            None
        };
        self.store.append_audit(
            AdminAction::Disable,
            target,
            actor,
            reason.as_deref(),
            &json!({
                "notify_user": notify_user,
                "notification": notification.as_ref().map(|n| n.label()),
            }),
        )?;

        info!(
            "{} disabled notifications for {} ({})",
            actor,
            target.key(),
            reason.as_deref().unwrap_or("no reason given")
        );
        Ok(DisableOutcome {
            admin_override,
            notification,
        })
    }

    /// Goes through the normal enqueue path except for the override check,
    /// which would reject it.
    fn notify_disabled(
        &self,
        target: &OverrideTarget,
        reason: Option<&str>,
    ) -> Result<EnqueueOutcome, AdminError> {
        let what = match target {
            OverrideTarget::TriggerPreference { trigger, .. } => {
                format!("{} notifications", trigger.as_str())
            }
            OverrideTarget::SavedSearch { search_id, .. } => {
                format!("notifications for saved search {}", search_id)
            }
        };
        let request = EnqueueRequest::new(
            target.username(),
            NotificationTrigger::AdminNotice,
            &[Channel::Email],
        )
        .with_priority(Priority::High)
        .with_data(json!({
            "message": format!("An administrator has paused your {}.", what),
            "reason": reason,
        }))
        .with_dedup_key(format!(
            "admin_disable:{}:{}",
            target.key(),
            Utc::now().timestamp_millis()
        ));
        Ok(self.service.enqueue_bypassing_overrides(&request)?)
    }

    /// Removes the override entirely, restoring user-controlled behavior.
    pub fn enable(&self, target: &OverrideTarget, actor: &str) -> Result<(), AdminError> {
        if !self.store.delete_override(target)? {
            return Err(AdminError::NotFound(format!("override for {}", target.key())));
        }
        self.store
            .append_audit(AdminAction::Enable, target, actor, None, &json!({}))?;
        info!("{} re-enabled notifications for {}", actor, target.key());
        Ok(())
    }

    /// Sends a synthetic notification for the target right now. Blocks on the
    /// provider; call from a blocking thread.
    pub fn test(
        &self,
        target: &OverrideTarget,
        channel: Option<Channel>,
        recipient_override: Option<String>,
        actor: &str,
    ) -> Result<TestDeliveryReport, AdminError> {
        self.ensure_target_exists(target)?;
        let trigger = target.trigger();

        let channel = match channel {
            Some(c) => c,
            None => {
                let mut preference = self.store.get_preference(target.username(), trigger)?;
                if let (Some(pref), Some(ov)) = (&preference, self.store.get_override(target)?) {
                    preference = Some(ov.apply_to(pref));
                }
                preference
                    .and_then(|p| p.channels.first().copied())
                    .unwrap_or(Channel::Email)
            }
        };

        let report = self.delivery.send_test(&TestMessage {
            username: target.username().to_string(),
            trigger,
            channel,
            template_data: json!({
                "actor": actor,
                "actorName": actor,
                "message": "This is a test notification.",
            }),
            recipient_override: recipient_override.clone(),
        });
        self.store.append_audit(
            AdminAction::Test,
            target,
            actor,
            None,
            &json!({
                "channel": channel,
                "recipient_override": recipient_override,
                "success": report.success,
                "error": report.error,
            }),
        )?;
        info!(
            "{} sent a test {} notification for {}: success={}",
            actor,
            channel.as_str(),
            target.key(),
            report.success
        );
        Ok(report)
    }

    pub fn list_overrides(&self) -> Result<Vec<AdminOverride>, AdminError> {
        Ok(self.store.list_overrides()?)
    }

    pub fn audit_log(&self, limit: usize, offset: usize) -> Result<Vec<AdminAuditEntry>, AdminError> {
        Ok(self.store.list_audit(limit, offset)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::delivery::tests::{pipeline_with, RecordingProvider};
    use crate::notifications::directory::{UserDirectory, UserProfile};
    use crate::notifications::models::{QueueFilter, RejectReason};
    use crate::notifications::preferences::Frequency;
    use crate::notifications::sqlite_store::SqliteNotificationStore;

    struct Fixture {
        store: Arc<SqliteNotificationStore>,
        service: Arc<NotificationService>,
        provider: Arc<RecordingProvider>,
        manager: AdminOverrideManager,
    }

    fn setup() -> Fixture {
        let store = Arc::new(SqliteNotificationStore::in_memory().unwrap());
        let service = Arc::new(NotificationService::new(store.clone(), 3600));
        service.register_user("alice", None).unwrap();
        let mut settings = store.get_settings("alice").unwrap().unwrap();
        settings.quiet_hours.enabled = false;
        store.save_settings(&settings).unwrap();
        store
            .upsert_profile(&UserProfile {
                email: Some("alice@example.com".to_string()),
                ..UserProfile::new("alice")
            })
            .unwrap();

        let provider = Arc::new(RecordingProvider::default());
        let delivery = Arc::new(pipeline_with(store.clone(), provider.clone()));
        let manager = AdminOverrideManager::new(store.clone(), service.clone(), delivery);
        Fixture {
            store,
            service,
            provider,
            manager,
        }
    }

    fn digest() -> OverrideTarget {
        OverrideTarget::TriggerPreference {
            username: "alice".to_string(),
            trigger: NotificationTrigger::WeeklyDigest,
        }
    }

    #[test]
    fn test_override_requires_a_field() {
        let f = setup();
        let err = f
            .manager
            .override_target(&digest(), &OverrideFields::default(), None, "root")
            .unwrap_err();
        assert!(matches!(err, AdminError::Validation(_)));
        assert!(f.manager.audit_log(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_override_keeps_user_preference() {
        let f = setup();
        let fields = OverrideFields {
            frequency: Some(Frequency::Daily),
            time: Some("18:00".to_string()),
            ..Default::default()
        };
        let ov = f
            .manager
            .override_target(&digest(), &fields, Some("evening".to_string()), "root")
            .unwrap();
        assert_eq!(ov.fields.frequency, Some(Frequency::Daily));

        let pref = f
            .store
            .get_preference("alice", NotificationTrigger::WeeklyDigest)
            .unwrap()
            .unwrap();
        assert_eq!(pref.frequency, Frequency::Weekly);

        let audit = f.manager.audit_log(10, 0).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AdminAction::Override);
        assert_eq!(audit[0].actor, "root");
        assert_eq!(audit[0].reason.as_deref(), Some("evening"));
    }

    #[test]
    fn test_unknown_user_is_not_found() {
        let f = setup();
        let target = OverrideTarget::TriggerPreference {
            username: "ghost".to_string(),
            trigger: NotificationTrigger::Favorited,
        };
        assert!(matches!(
            f.manager.disable(&target, None, false, "root"),
            Err(AdminError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.enable(&target, "root"),
            Err(AdminError::NotFound(_))
        ));
    }

    #[test]
    fn test_disable_notifies_user_and_enable_restores() {
        let f = setup();
        let target = OverrideTarget::TriggerPreference {
            username: "alice".to_string(),
            trigger: NotificationTrigger::Favorited,
        };
        let outcome = f
            .manager
            .disable(&target, Some("spam".to_string()), true, "root")
            .unwrap();
        assert!(outcome.admin_override.disabled);
        assert!(matches!(
            outcome.notification,
            Some(EnqueueOutcome::Enqueued { .. })
        ));
        let notices = f.store.list_queue(&QueueFilter::default()).unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].trigger, NotificationTrigger::AdminNotice);

        let request =
            EnqueueRequest::new("alice", NotificationTrigger::Favorited, &[Channel::Email]);
        assert_eq!(
            f.service.enqueue(&request).unwrap(),
            EnqueueOutcome::rejected(RejectReason::AdminDisabled)
        );

        f.manager.enable(&target, "root").unwrap();
        assert!(f.store.get_override(&target).unwrap().is_none());
        assert!(matches!(
            f.service.enqueue(&request).unwrap(),
            EnqueueOutcome::Enqueued { .. }
        ));

        let actions: Vec<_> = f
            .manager
            .audit_log(10, 0)
            .unwrap()
            .into_iter()
            .map(|a| a.action)
            .collect();
        assert_eq!(actions, vec![AdminAction::Enable, AdminAction::Disable]);
    }

    #[test]
    fn test_disable_keeps_existing_override_fields() {
        let f = setup();
        let fields = OverrideFields {
            time: Some("07:00".to_string()),
            ..Default::default()
        };
        f.manager.override_target(&digest(), &fields, None, "root").unwrap();
        let outcome = f.manager.disable(&digest(), None, false, "root").unwrap();
        assert!(outcome.notification.is_none());
        assert_eq!(outcome.admin_override.fields.time.as_deref(), Some("07:00"));
        assert_eq!(f.manager.list_overrides().unwrap().len(), 1);
    }

    #[test]
    fn test_send_test_uses_recipient_override() {
        let f = setup();
        let report = f
            .manager
            .test(&digest(), None, Some("qa@example.com".to_string()), "root")
            .unwrap();
        assert!(report.success);
        assert_eq!(report.channel, Channel::Email);
        assert_eq!(report.recipient.as_deref(), Some("qa@example.com"));
        assert_eq!(f.provider.sent.lock().unwrap()[0].0, "qa@example.com");
        assert!(f.store.list_queue(&QueueFilter::default()).unwrap().is_empty());

        let audit = f.manager.audit_log(10, 0).unwrap();
        assert_eq!(audit[0].action, AdminAction::Test);
        assert_eq!(audit[0].details["success"], true);
    }
}
