//! Maps domain actions to notification requests.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};

use super::directory::{UserDirectory, UserProfile};
use super::models::{Channel, EnqueueOutcome, EnqueueRequest, NotificationTrigger, Priority};
use super::overrides::OverrideTarget;
use super::render::{truncate_chars, PREVIEW_LENGTH};
use super::service::NotificationService;
use crate::server::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FavoriteAdded,
    FavoriteRemoved,
    ShortlistAdded,
    ShortlistRemoved,
    ProfileViewed,
    MessageSent,
    UnreadMessages,
    PiiRequested,
    PiiGranted,
    PiiRejected,
    PiiExpiring,
    SuspiciousLogin,
    UserSuspended,
    UserBanned,
    SavedSearchMatch,
    NewMatch,
    UserExcluded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FavoriteAdded => "favorite_added",
            EventType::FavoriteRemoved => "favorite_removed",
            EventType::ShortlistAdded => "shortlist_added",
            EventType::ShortlistRemoved => "shortlist_removed",
            EventType::ProfileViewed => "profile_viewed",
            EventType::MessageSent => "message_sent",
            EventType::UnreadMessages => "unread_messages",
            EventType::PiiRequested => "pii_requested",
            EventType::PiiGranted => "pii_granted",
            EventType::PiiRejected => "pii_rejected",
            EventType::PiiExpiring => "pii_expiring",
            EventType::SuspiciousLogin => "suspicious_login",
            EventType::UserSuspended => "user_suspended",
            EventType::UserBanned => "user_banned",
            EventType::SavedSearchMatch => "saved_search_match",
            EventType::NewMatch => "new_match",
            EventType::UserExcluded => "user_excluded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "favorite_added" => EventType::FavoriteAdded,
            "favorite_removed" => EventType::FavoriteRemoved,
            "shortlist_added" => EventType::ShortlistAdded,
            "shortlist_removed" => EventType::ShortlistRemoved,
            "profile_viewed" => EventType::ProfileViewed,
            "message_sent" => EventType::MessageSent,
            "unread_messages" => EventType::UnreadMessages,
            "pii_requested" => EventType::PiiRequested,
            "pii_granted" => EventType::PiiGranted,
            "pii_rejected" => EventType::PiiRejected,
            "pii_expiring" => EventType::PiiExpiring,
            "suspicious_login" => EventType::SuspiciousLogin,
            "user_suspended" => EventType::UserSuspended,
            "user_banned" => EventType::UserBanned,
            "saved_search_match" => EventType::SavedSearchMatch,
            "new_match" => EventType::NewMatch,
            "user_excluded" => EventType::UserExcluded,
            _ => return None,
        })
    }
}

/// A domain action reported by another service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub actor: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub context: JsonValue,
}

impl DomainEvent {
    pub fn new(event_type: EventType, actor: &str, target: Option<&str>, context: JsonValue) -> Self {
        Self {
            event_type: event_type.as_str().to_string(),
            actor: actor.to_string(),
            target: target.map(str::to_string),
            context,
        }
    }

    fn target(&self) -> Result<&str> {
        match self.target.as_deref() {
            Some(t) if !t.is_empty() => Ok(t),
            _ => bail!("event {} requires a target user", self.event_type),
        }
    }

    fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(JsonValue::as_str)
    }
}

/// What a dispatch did. Never carries an error: failures are logged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub handled: bool,
    pub outcomes: Vec<EnqueueOutcome>,
    pub cancelled: usize,
}

pub struct EventDispatcher {
    service: Arc<NotificationService>,
    directory: Arc<dyn UserDirectory>,
}

impl EventDispatcher {
    pub fn new(service: Arc<NotificationService>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { service, directory }
    }

    /// Runs the handler for `event`. The calling domain operation must not
    /// depend on the result.
    pub fn dispatch(&self, event: &DomainEvent) -> DispatchSummary {
        let Some(event_type) = EventType::parse(&event.event_type) else {
            warn!("Ignoring unknown event type '{}'", event.event_type);
            metrics::record_event("unknown");
            return DispatchSummary::default();
        };
        metrics::record_event(event_type.as_str());

        match self.handle(event_type, event) {
            Ok(summary) => summary,
            Err(e) => {
                error!(
                    "Failed to handle {} from {}: {:#}",
                    event_type.as_str(),
                    event.actor,
                    e
                );
                metrics::record_dispatch_error();
                DispatchSummary::default()
            }
        }
    }

    fn handle(&self, event_type: EventType, event: &DomainEvent) -> Result<DispatchSummary> {
        use Channel::*;
        use NotificationTrigger as T;

        let mut summary = DispatchSummary {
            handled: true,
            ..Default::default()
        };
        let actor = event.actor.as_str();

        match event_type {
            EventType::FavoriteAdded => {
                let target = event.target()?;
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(target, T::Favorited, &[Email, Push]),
                    actor,
                    event,
                )?);
                let mutual = event
                    .context
                    .get("mutual")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false);
                if mutual {
                    summary.outcomes.push(self.notify(
                        EnqueueRequest::new(target, T::MutualFavorite, &[Email, Push])
                            .with_priority(Priority::High),
                        actor,
                        event,
                    )?);
                    summary.outcomes.push(self.notify(
                        EnqueueRequest::new(actor, T::MutualFavorite, &[Email, Push])
                            .with_priority(Priority::High),
                        target,
                        event,
                    )?);
                }
            }
            EventType::FavoriteRemoved => {
                summary.cancelled = self.service.cancel_pending_from_actor(
                    event.target()?,
                    &[T::Favorited, T::MutualFavorite],
                    actor,
                )?;
            }
            EventType::ShortlistAdded => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(event.target()?, T::ShortlistAdded, &[Email]),
                    actor,
                    event,
                )?);
            }
            EventType::ShortlistRemoved => {
                summary.cancelled = self.service.cancel_pending_from_actor(
                    event.target()?,
                    &[T::ShortlistAdded],
                    actor,
                )?;
            }
            EventType::ProfileViewed => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(event.target()?, T::ProfileView, &[Push])
                        .with_priority(Priority::Low),
                    actor,
                    event,
                )?);
            }
            EventType::MessageSent => {
                let mut request = EnqueueRequest::new(event.target()?, T::NewMessage, &[Sms, Push])
                    .with_priority(Priority::High);
                match event.context.get("messageId") {
                    Some(JsonValue::String(id)) => {
                        request = request.with_dedup_key(format!("message:{}", id))
                    }
                    Some(JsonValue::Number(id)) => {
                        request = request.with_dedup_key(format!("message:{}", id))
                    }
                    _ => {}
                }
                summary.outcomes.push(self.notify(request, actor, event)?);
            }
            EventType::UnreadMessages => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(actor, T::UnreadMessages, &[Email])
                        .with_priority(Priority::Low),
                    actor,
                    event,
                )?);
            }
            EventType::PiiRequested => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(event.target()?, T::PiiRequest, &[Email, Sms])
                        .with_priority(Priority::High),
                    actor,
                    event,
                )?);
            }
            EventType::PiiGranted => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(event.target()?, T::PiiGranted, &[Email, Push])
                        .with_priority(Priority::High),
                    actor,
                    event,
                )?);
            }
            EventType::PiiRejected => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(event.target()?, T::PiiDenied, &[Email]),
                    actor,
                    event,
                )?);
            }
            EventType::PiiExpiring => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(event.target()?, T::PiiExpiring, &[Email]),
                    actor,
                    event,
                )?);
            }
            EventType::SuspiciousLogin => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(actor, T::SuspiciousLogin, &[Email, Sms])
                        .with_priority(Priority::Critical),
                    actor,
                    event,
                )?);
            }
            EventType::UserSuspended | EventType::UserBanned => {
                let status = if event_type == EventType::UserBanned {
                    "banned"
                } else {
                    "suspended"
                };
                let mut request = EnqueueRequest::new(event.target()?, T::AccountStatus, &[Email])
                    .with_priority(Priority::Critical);
                request.template_data = serde_json::json!({ "status": status });
                summary.outcomes.push(self.notify(request, actor, event)?);
            }
            EventType::SavedSearchMatch => {
                let target = event.target()?;
                let search_id = event
                    .context_str("searchId")
                    .context("saved_search_match requires context.searchId")?;
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(target, T::NewUsersMatching, &[Email]).related_to(
                        OverrideTarget::SavedSearch {
                            username: target.to_string(),
                            search_id: search_id.to_string(),
                        },
                    ),
                    actor,
                    event,
                )?);
            }
            EventType::NewMatch => {
                summary.outcomes.push(self.notify(
                    EnqueueRequest::new(event.target()?, T::NewMatch, &[Email, Push]),
                    actor,
                    event,
                )?);
            }
            EventType::UserExcluded => {
                info!(
                    "{} excluded {:?}; no notification is sent",
                    actor, event.target
                );
            }
        }
        Ok(summary)
    }

    /// Fills template data from the profile of `about` plus the event context
    /// and enqueues the request.
    fn notify(
        &self,
        mut request: EnqueueRequest,
        about: &str,
        event: &DomainEvent,
    ) -> Result<EnqueueOutcome> {
        let data = self.template_data(about, event, &request.template_data)?;
        request.template_data = data;
        if request.actor.is_none() && about != request.username {
            request.actor = Some(about.to_string());
        }
        let outcome = self.service.enqueue(&request)?;
        debug!(
            "{} -> {} for {}: {}",
            event.event_type,
            request.trigger.as_str(),
            request.username,
            outcome.label()
        );
        Ok(outcome)
    }

    fn template_data(
        &self,
        about: &str,
        event: &DomainEvent,
        extra: &JsonValue,
    ) -> Result<JsonValue> {
        let profile = self
            .directory
            .get_profile(about)?
            .unwrap_or_else(|| UserProfile::new(about));

        let mut data = Map::new();
        if let JsonValue::Object(context) = &event.context {
            data.extend(context.clone());
        }
        if let Some(message) = event.context_str("message") {
            data.insert(
                "message".to_string(),
                JsonValue::String(truncate_chars(message, PREVIEW_LENGTH)),
            );
        }
        if let JsonValue::Object(extra) = extra {
            data.extend(extra.clone());
        }
        if let JsonValue::Object(fields) = profile.actor_fields() {
            data.extend(fields);
        }
        Ok(JsonValue::Object(data))
    }
}
