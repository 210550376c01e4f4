use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::overrides::OverrideTarget;

/// A delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "push" => Some(Channel::Push),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Claim ordering, highest first.
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

macro_rules! notification_triggers {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Domain event categories that can produce a notification.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum NotificationTrigger {
            $($variant),+
        }

        impl NotificationTrigger {
            pub const ALL: &'static [NotificationTrigger] = &[$(NotificationTrigger::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(NotificationTrigger::$variant => $name),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($name => Some(NotificationTrigger::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

notification_triggers! {
    NewMatch => "new_match",
    MutualFavorite => "mutual_favorite",
    Favorited => "favorited",
    ShortlistAdded => "shortlist_added",
    MatchMilestone => "match_milestone",
    ProfileView => "profile_view",
    ProfileVisibilitySpike => "profile_visibility_spike",
    SearchAppearance => "search_appearance",
    NewMessage => "new_message",
    MessageRead => "message_read",
    ConversationCold => "conversation_cold",
    PiiRequest => "pii_request",
    PiiGranted => "pii_granted",
    PiiDenied => "pii_denied",
    PiiExpiring => "pii_expiring",
    SuspiciousLogin => "suspicious_login",
    AccountStatus => "account_status",
    UnreadMessages => "unread_messages",
    NewUsersMatching => "new_users_matching",
    ProfileIncomplete => "profile_incomplete",
    UploadPhotos => "upload_photos",
    WeeklyDigest => "weekly_digest",
    MonthlyDigest => "monthly_digest",
    AdminNotice => "admin_notice",
}

/// Lifecycle of a queue entry. Transitions only go
/// pending -> processing -> {sent | failed}, with processing -> pending
/// allowed for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "sent" => Some(QueueStatus::Sent),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed)
    }

    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (QueueStatus::Pending, QueueStatus::Processing)
                | (QueueStatus::Processing, QueueStatus::Sent)
                | (QueueStatus::Processing, QueueStatus::Failed)
                | (QueueStatus::Processing, QueueStatus::Pending)
        )
    }
}

/// A persisted notification awaiting (or having finished) delivery on one
/// channel.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationQueueEntry {
    pub id: i64,
    pub username: String,
    pub trigger: NotificationTrigger,
    pub channel: Channel,
    pub template_data: JsonValue,
    pub priority: Priority,
    pub status: QueueStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub dedup_key: String,
    pub actor: Option<String>,
}

/// Row inserted by the notification service.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub username: String,
    pub trigger: NotificationTrigger,
    pub channel: Channel,
    pub template_data: JsonValue,
    pub priority: Priority,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub dedup_key: String,
    pub actor: Option<String>,
}

/// Request to notify `username` of `trigger` on (a subset of) `channels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub username: String,
    pub trigger: NotificationTrigger,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub template_data: JsonValue,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default)]
    pub dedup_key: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    /// Additional override target consulted besides (username, trigger).
    #[serde(default)]
    pub related_target: Option<OverrideTarget>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

impl EnqueueRequest {
    pub fn new(username: impl Into<String>, trigger: NotificationTrigger, channels: &[Channel]) -> Self {
        Self {
            username: username.into(),
            trigger,
            channels: channels.to_vec(),
            template_data: JsonValue::Object(Default::default()),
            priority: Priority::Medium,
            dedup_key: None,
            actor: None,
            related_target: None,
        }
    }

    pub fn with_data(mut self, template_data: JsonValue) -> Self {
        self.template_data = template_data;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn from_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn related_to(mut self, target: OverrideTarget) -> Self {
        self.related_target = Some(target);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AdminDisabled,
    NoPreferenceConfigured,
    NoChannelsEnabled,
    Duplicate,
    RateLimited,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AdminDisabled => "admin_disabled",
            RejectReason::NoPreferenceConfigured => "no_preference_configured",
            RejectReason::NoChannelsEnabled => "no_channels_enabled",
            RejectReason::Duplicate => "duplicate",
            RejectReason::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued { entry_ids: Vec<i64> },
    Rejected { reason: RejectReason },
}

impl EnqueueOutcome {
    pub fn rejected(reason: RejectReason) -> Self {
        EnqueueOutcome::Rejected { reason }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EnqueueOutcome::Enqueued { .. } => "enqueued",
            EnqueueOutcome::Rejected { reason } => reason.as_str(),
        }
    }

    pub fn entry_ids(&self) -> &[i64] {
        match self {
            EnqueueOutcome::Enqueued { entry_ids } => entry_ids,
            EnqueueOutcome::Rejected { .. } => &[],
        }
    }
}

/// Filters for listing queue entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueFilter {
    pub status: Option<QueueStatus>,
    pub username: Option<String>,
    pub channel: Option<Channel>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub by_channel: Vec<ChannelStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel: Channel,
    pub status: QueueStatus,
    pub count: u64,
}

/// One delivery attempt, kept for history.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationLogEntry {
    pub id: i64,
    pub queue_entry_id: Option<i64>,
    pub username: String,
    pub trigger: NotificationTrigger,
    pub channel: Channel,
    pub priority: Priority,
    pub status: String,
    pub subject: Option<String>,
    pub preview: Option<String>,
    pub error: Option<String>,
    pub is_test: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub username: Option<String>,
    pub limit: Option<usize>,
}
