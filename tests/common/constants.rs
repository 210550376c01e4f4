//! Shared constants for end-to-end tests

// ============================================================================
// Test Users
// ============================================================================

/// User receiving notifications in most scenarios
pub const TEST_USER: &str = "alice";

/// Email registered for TEST_USER
pub const TEST_USER_EMAIL: &str = "alice@example.com";

/// User performing domain actions (favoriting, messaging)
pub const ACTOR_USER: &str = "bob";

/// Email registered for ACTOR_USER
pub const ACTOR_USER_EMAIL: &str = "bob@example.com";

/// Value sent in the X-Admin-User header by admin clients
pub const ADMIN_USER: &str = "admin";

// ============================================================================
// Timeouts
// ============================================================================

/// Maximum time to wait for server to become ready
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Request timeout for HTTP client
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Polling interval while waiting for server readiness or job completion
pub const POLL_INTERVAL_MS: u64 = 50;

/// Maximum time to wait for a manually triggered job to finish
pub const JOB_COMPLETION_TIMEOUT_MS: u64 = 10_000;
