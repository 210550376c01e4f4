//! Test server lifecycle management
//!
//! Each test gets an isolated server with its own job and notification
//! databases. The scheduler is started with a long tick interval, so jobs
//! only run when a test triggers them.

use super::constants::*;
use matchmaking_notifier::config::{AppConfig, CliConfig, FileConfig};
use matchmaking_notifier::job_store::SqliteJobStore;
use matchmaking_notifier::notifications::SqliteNotificationStore;
use matchmaking_notifier::{build_app, make_app, RequestsLoggingLevel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const BASE_CONFIG: &str = r#"
[scheduler]
tick_interval_secs = 3600
seed_default_jobs = false
shutdown_grace_secs = 1

[notifications]
retry_initial_backoff_secs = 0
"#;

/// Test server instance with isolated databases
///
/// When dropped, the server and the scheduler shut down and temp resources
/// are cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Notification store for direct database access in tests
    pub notification_store: Arc<SqliteNotificationStore>,

    // Private fields - keep resources alive until drop
    _temp_db_dir: TempDir,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Spawns a new test server on a random port with the default test config
    pub async fn spawn() -> Self {
        Self::spawn_with_config("").await
    }

    /// Spawns a test server whose TOML config is the default test config
    /// followed by `extra_toml`.
    ///
    /// # Panics
    ///
    /// Panics if the databases cannot be created, the port cannot be bound
    /// or the server doesn't become ready within the timeout.
    pub async fn spawn_with_config(extra_toml: &str) -> Self {
        let temp_db_dir = TempDir::new().expect("Failed to create temp db dir");
        let file_config: FileConfig = toml::from_str(&format!("{}\n{}", BASE_CONFIG, extra_toml))
            .expect("Invalid test config");
        let config = AppConfig::resolve(
            &CliConfig {
                db_dir: Some(temp_db_dir.path().to_path_buf()),
                port: 0,
                metrics_port: 0,
                logging_level: RequestsLoggingLevel::None,
            },
            Some(file_config),
        )
        .expect("Failed to resolve test config");

        let job_store = Arc::new(
            SqliteJobStore::new(config.jobs_db_path()).expect("Failed to open job store"),
        );
        let notification_store = Arc::new(
            SqliteNotificationStore::new(config.notifications_db_path())
                .expect("Failed to open notification store"),
        );

        let shutdown = CancellationToken::new();
        let app = build_app(
            &config,
            job_store,
            notification_store.clone(),
            shutdown.clone(),
        )
        .expect("Failed to build app");
        app.scheduler.start();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let router = make_app(app.state);
        let server_shutdown = shutdown.clone();
        let scheduler = app.scheduler;
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .expect("Server failed");
            scheduler.stop().await;
        });

        let server = Self {
            base_url,
            port,
            notification_store,
            _temp_db_dir: temp_db_dir,
            shutdown,
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling the /health endpoint
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await,
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        // TempDir will be cleaned up automatically
    }
}
