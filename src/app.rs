//! Wiring of stores, the delivery pipeline, the scheduler and the HTTP state.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::background_jobs::templates::{default_job_definitions, register_builtin_templates};
use crate::background_jobs::{create_scheduler, JobContext, JobTemplateRegistry, UnifiedScheduler};
use crate::config::AppConfig;
use crate::job_store::JobStore;
use crate::notifications::{
    AdminOverrideManager, ChannelProviders, DeliveryPipeline, EventDispatcher,
    NotificationService, PlaintextDecryptor, RetryPolicy, SqliteNotificationStore,
};
use crate::server::{ServerConfig, ServerState};

/// A fully wired service, ready to be started and served.
pub struct NotifierApp {
    pub scheduler: UnifiedScheduler,
    pub state: ServerState,
}

/// Builds every component from `config`. Registers the built-in templates,
/// seeds the default jobs when the job store is empty and backfills missing
/// trigger preferences. The scheduler is returned unstarted.
pub fn build_app(
    config: &AppConfig,
    job_store: Arc<dyn JobStore>,
    notification_store: Arc<SqliteNotificationStore>,
    shutdown: CancellationToken,
) -> Result<NotifierApp> {
    let providers = ChannelProviders::from_settings(&config.providers)
        .context("Failed to configure channel providers")?;
    let delivery = Arc::new(DeliveryPipeline::new(
        notification_store.clone(),
        notification_store.clone(),
        providers,
        Arc::new(PlaintextDecryptor),
        RetryPolicy::new(&config.notifications),
    ));
    let service = Arc::new(NotificationService::new(
        notification_store.clone(),
        config.notifications.dedup_window_secs,
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        service.clone(),
        notification_store.clone(),
    ));
    let admin_manager = Arc::new(AdminOverrideManager::new(
        notification_store.clone(),
        service.clone(),
        delivery.clone(),
    ));

    let mut registry = JobTemplateRegistry::new();
    register_builtin_templates(&mut registry, &config.notifications)?;
    info!("Registered {} job templates", registry.len());

    let job_context = JobContext::new(
        shutdown,
        job_store,
        notification_store.clone(),
        delivery,
    );
    let (scheduler, handle) =
        create_scheduler(config.scheduler.clone(), Arc::new(registry), job_context);

    if config.scheduler.seed_default_jobs {
        let seeded = handle.seed_defaults_if_empty(default_job_definitions())?;
        if seeded > 0 {
            info!("Created {} default jobs", seeded);
        }
    }

    let backfilled = service.backfill_missing_triggers()?;
    if backfilled > 0 {
        info!("Backfilled {} missing trigger preferences", backfilled);
    }

    let state = ServerState {
        config: ServerConfig {
            requests_logging_level: config.logging_level.clone(),
            port: config.port,
            metrics_port: config.metrics_port,
        },
        start_time: Instant::now(),
        scheduler_handle: handle,
        notification_service: service,
        event_dispatcher: dispatcher,
        admin_manager,
        notification_store: notification_store.clone(),
        user_directory: notification_store,
    };

    Ok(NotifierApp { scheduler, state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliConfig, FileConfig};
    use crate::job_store::SqliteJobStore;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir, seed: bool) -> AppConfig {
        let file: FileConfig = toml::from_str(&format!(
            "[scheduler]\nseed_default_jobs = {}\n",
            seed
        ))
        .unwrap();
        AppConfig::resolve(
            &CliConfig {
                db_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            },
            Some(file),
        )
        .unwrap()
    }

    #[test]
    fn test_build_seeds_default_jobs_once() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, true);
        let job_store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(config.jobs_db_path()).unwrap());
        let notification_store =
            Arc::new(SqliteNotificationStore::new(config.notifications_db_path()).unwrap());

        let app = build_app(
            &config,
            job_store.clone(),
            notification_store.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let jobs = app.state.scheduler_handle.list_jobs().unwrap();
        assert_eq!(jobs.len(), 7);
        assert!(jobs.iter().all(|j| j.next_run_at.is_some()));

        build_app(&config, job_store, notification_store, CancellationToken::new()).unwrap();
        assert_eq!(app.state.scheduler_handle.list_jobs().unwrap().len(), 7);
    }

    #[test]
    fn test_build_without_seeding() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, false);
        let app = build_app(
            &config,
            Arc::new(SqliteJobStore::in_memory().unwrap()),
            Arc::new(SqliteNotificationStore::in_memory().unwrap()),
            CancellationToken::new(),
        )
        .unwrap();
        assert!(app.state.scheduler_handle.list_jobs().unwrap().is_empty());
        assert_eq!(app.state.scheduler_handle.list_templates().len(), 7);
        assert!(!app.scheduler.is_started());
    }
}
