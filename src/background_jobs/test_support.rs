//! In-memory stores and a job context for template and scheduler tests.

use super::context::JobContext;
use crate::job_store::SqliteJobStore;
use crate::notifications::{
    ChannelProviders, DeliveryPipeline, NotificationService, NotificationStore,
    PlaintextDecryptor, RetryPolicy, SqliteNotificationStore, UserDirectory, UserProfile,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Fixture {
    pub store: Arc<SqliteNotificationStore>,
    pub job_store: Arc<SqliteJobStore>,
    pub service: NotificationService,
    pub delivery: Arc<DeliveryPipeline>,
}

pub fn fixture() -> Fixture {
    let store = Arc::new(SqliteNotificationStore::in_memory().unwrap());
    let job_store = Arc::new(SqliteJobStore::in_memory().unwrap());
    let delivery = Arc::new(DeliveryPipeline::new(
        store.clone(),
        store.clone(),
        ChannelProviders::log_only(),
        Arc::new(PlaintextDecryptor),
        RetryPolicy {
            initial_backoff_secs: 0,
            ..RetryPolicy::default()
        },
    ));
    let service = NotificationService::new(store.clone(), 3600);
    Fixture {
        store,
        job_store,
        service,
        delivery,
    }
}

pub fn context() -> (JobContext, Fixture) {
    let fixture = fixture();
    let ctx = JobContext::new(
        CancellationToken::new(),
        fixture.job_store.clone(),
        fixture.store.clone(),
        fixture.delivery.clone(),
    );
    (ctx, fixture)
}

/// Registers a reachable user with quiet hours turned off.
pub fn register_user(fixture: &Fixture, username: &str, email: &str) {
    fixture.service.register_user(username, None).unwrap();
    let mut settings = fixture.store.get_settings(username).unwrap().unwrap();
    settings.quiet_hours.enabled = false;
    fixture.store.save_settings(&settings).unwrap();
    fixture
        .store
        .upsert_profile(&UserProfile {
            email: Some(email.to_string()),
            ..UserProfile::new(username)
        })
        .unwrap();
}
