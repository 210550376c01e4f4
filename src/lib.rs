//! Matchmaking Notifier Library
//!
//! Background job scheduling and the event-driven notification pipeline,
//! exposed for the server binary and the end-to-end tests.

pub mod app;
pub mod background_jobs;
pub mod config;
pub mod job_store;
pub mod notifications;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use app::{build_app, NotifierApp};
pub use server::{make_app, run_server, RequestsLoggingLevel};
