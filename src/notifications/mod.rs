//! Notification preferences, the enqueue decision, the persisted queue and
//! delivery.

mod admin;
mod delivery;
mod directory;
mod dispatcher;
mod models;
mod overrides;
mod preferences;
mod providers;
mod render;
mod retry_policy;
mod schema;
mod service;
mod sqlite_store;
mod store;

pub use admin::{AdminError, AdminOverrideManager, DisableOutcome};
pub use delivery::{
    BatchOptions, BatchReport, DeliveryError, DeliveryPipeline, TestDeliveryReport, TestMessage,
};
pub use directory::{UserDirectory, UserProfile};
pub use dispatcher::{DispatchSummary, DomainEvent, EventDispatcher, EventType};
pub use models::{
    Channel, ChannelStats, EnqueueOutcome, EnqueueRequest, LogFilter, NewQueueEntry,
    NotificationLogEntry, NotificationQueueEntry, NotificationTrigger, Priority, QueueFilter,
    QueueStats, QueueStatus, RejectReason,
};
pub use overrides::{AdminAction, AdminAuditEntry, AdminOverride, OverrideFields, OverrideTarget};
pub use preferences::{
    default_preferences, Frequency, NotificationSettings, QuietHours, RateLimit, RatePeriod,
    TriggerPreference,
};
pub use providers::{
    ChannelProvider, ChannelProviders, DecryptionError, LogOnlyProvider, PiiDecryptor,
    PlaintextDecryptor, ProviderError, WebhookProvider,
};
pub use render::{render_message, RenderedMessage};
pub use retry_policy::RetryPolicy;
pub use service::{NotificationService, PreferenceError, PreferencesUpdate, UserPreferences};
pub use sqlite_store::SqliteNotificationStore;
pub use store::{
    ActivityCounts, EnqueueWrite, MessageTemplate, NotificationStore, RateCap, ReconcileReport,
};

#[cfg(feature = "mock")]
pub use providers::{MockChannelProvider, MockPiiDecryptor};
