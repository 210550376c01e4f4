use super::models::{Channel, NotificationTrigger};
use super::preferences::{parse_hhmm, parse_weekday, Frequency, TriggerPreference};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The notifiable entity an admin override is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverrideTarget {
    /// A user's preference for one trigger.
    TriggerPreference {
        username: String,
        trigger: NotificationTrigger,
    },
    /// A user's saved search, whose match notifications can be suppressed.
    SavedSearch { username: String, search_id: String },
}

impl OverrideTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            OverrideTarget::TriggerPreference { .. } => "trigger_preference",
            OverrideTarget::SavedSearch { .. } => "saved_search",
        }
    }

    /// Stable key used for persistence and audit records.
    pub fn key(&self) -> String {
        match self {
            OverrideTarget::TriggerPreference { username, trigger } => {
                format!("{}:{}", username, trigger.as_str())
            }
            OverrideTarget::SavedSearch {
                username,
                search_id,
            } => format!("{}:{}", username, search_id),
        }
    }

    /// The user whose notifications the target affects.
    pub fn username(&self) -> &str {
        match self {
            OverrideTarget::TriggerPreference { username, .. }
            | OverrideTarget::SavedSearch { username, .. } => username,
        }
    }

    /// The trigger a synthetic or explanatory notification for this target uses.
    pub fn trigger(&self) -> NotificationTrigger {
        match self {
            OverrideTarget::TriggerPreference { trigger, .. } => *trigger,
            OverrideTarget::SavedSearch { .. } => NotificationTrigger::NewUsersMatching,
        }
    }
}

/// Fields an admin may override on a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideFields {
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub frequency: Option<Frequency>,
    #[serde(default)]
    pub day_of_week: Option<String>,
}

impl OverrideFields {
    pub fn is_empty(&self) -> bool {
        self.channels.is_none()
            && self.time.is_none()
            && self.frequency.is_none()
            && self.day_of_week.is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("at least one overridable field must be set".to_string());
        }
        if let Some(time) = &self.time {
            parse_hhmm(time).ok_or_else(|| format!("invalid time '{}', expected HH:MM", time))?;
        }
        if let Some(day) = &self.day_of_week {
            parse_weekday(day).ok_or_else(|| format!("invalid day of week '{}'", day))?;
        }
        Ok(())
    }

    /// Overlays the set fields on top of `other`.
    fn merge_from(&mut self, other: &OverrideFields) {
        if other.channels.is_some() {
            self.channels = other.channels.clone();
        }
        if other.time.is_some() {
            self.time = other.time.clone();
        }
        if other.frequency.is_some() {
            self.frequency = other.frequency;
        }
        if other.day_of_week.is_some() {
            self.day_of_week = other.day_of_week.clone();
        }
    }
}

/// An admin modification to a target's normal notification behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminOverride {
    pub target: OverrideTarget,
    pub disabled: bool,
    #[serde(flatten)]
    pub fields: OverrideFields,
    pub reason: Option<String>,
    pub overridden_by: String,
    pub overridden_at: DateTime<Utc>,
}

impl AdminOverride {
    pub fn new(target: OverrideTarget, overridden_by: impl Into<String>) -> Self {
        Self {
            target,
            disabled: false,
            fields: OverrideFields::default(),
            reason: None,
            overridden_by: overridden_by.into(),
            overridden_at: Utc::now(),
        }
    }

    /// Merges `fields` into this override. The `disabled` flag is untouched.
    pub fn merge(&mut self, fields: &OverrideFields, reason: Option<String>, actor: &str) {
        self.fields.merge_from(fields);
        if reason.is_some() {
            self.reason = reason;
        }
        self.overridden_by = actor.to_string();
        self.overridden_at = Utc::now();
    }

    /// The preference as seen through this override. The stored user
    /// preference itself is never modified.
    pub fn apply_to(&self, pref: &TriggerPreference) -> TriggerPreference {
        TriggerPreference {
            trigger: pref.trigger,
            channels: self
                .fields
                .channels
                .clone()
                .unwrap_or_else(|| pref.channels.clone()),
            frequency: self.fields.frequency.unwrap_or(pref.frequency),
            time: self.fields.time.clone().or_else(|| pref.time.clone()),
            day_of_week: self
                .fields
                .day_of_week
                .clone()
                .or_else(|| pref.day_of_week.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Override,
    Disable,
    Enable,
    Test,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::Override => "override",
            AdminAction::Disable => "disable",
            AdminAction::Enable => "enable",
            AdminAction::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "override" => Some(AdminAction::Override),
            "disable" => Some(AdminAction::Disable),
            "enable" => Some(AdminAction::Enable),
            "test" => Some(AdminAction::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminAuditEntry {
    pub id: i64,
    pub action: AdminAction,
    pub target_type: String,
    pub target_key: String,
    pub actor: String,
    pub reason: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
