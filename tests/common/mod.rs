//! Shared harness for the end-to-end suites
//!
//! Every test spawns its own `TestServer` (fresh databases, random port,
//! running scheduler) and talks to it through a `TestClient`. Suites pull
//! everything from here:
//!
//! ```no_run
//! mod common;
//! use common::{TestClient, TestServer, TEST_USER, TEST_USER_EMAIL};
//!
//! #[tokio::test]
//! async fn test_user_gets_defaults() {
//!     let server = TestServer::spawn().await;
//!     let client = TestClient::new(server.base_url.clone());
//!     client.register_reachable_user(TEST_USER, TEST_USER_EMAIL).await;
//! }
//! ```

mod client;
mod constants;
mod server;

pub use client::{saved_search_target, trigger_target, TestClient};
pub use constants::*;
pub use server::TestServer;
