use axum::extract::FromRef;

use crate::background_jobs::SchedulerHandle;
use crate::notifications::{
    AdminOverrideManager, EventDispatcher, NotificationService, NotificationStore, UserDirectory,
};
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedNotificationService = Arc<NotificationService>;
pub type GuardedEventDispatcher = Arc<EventDispatcher>;
pub type GuardedAdminOverrideManager = Arc<AdminOverrideManager>;
pub type GuardedNotificationStore = Arc<dyn NotificationStore>;
pub type GuardedUserDirectory = Arc<dyn UserDirectory>;

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub scheduler_handle: SchedulerHandle,
    pub notification_service: GuardedNotificationService,
    pub event_dispatcher: GuardedEventDispatcher,
    pub admin_manager: GuardedAdminOverrideManager,
    pub notification_store: GuardedNotificationStore,
    pub user_directory: GuardedUserDirectory,
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for SchedulerHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler_handle.clone()
    }
}

impl FromRef<ServerState> for GuardedNotificationService {
    fn from_ref(input: &ServerState) -> Self {
        input.notification_service.clone()
    }
}

impl FromRef<ServerState> for GuardedEventDispatcher {
    fn from_ref(input: &ServerState) -> Self {
        input.event_dispatcher.clone()
    }
}

impl FromRef<ServerState> for GuardedAdminOverrideManager {
    fn from_ref(input: &ServerState) -> Self {
        input.admin_manager.clone()
    }
}

impl FromRef<ServerState> for GuardedNotificationStore {
    fn from_ref(input: &ServerState) -> Self {
        input.notification_store.clone()
    }
}

impl FromRef<ServerState> for GuardedUserDirectory {
    fn from_ref(input: &ServerState) -> Self {
        input.user_directory.clone()
    }
}
