//! HTTP client for end-to-end tests
//!
//! This module provides a high-level HTTP client that wraps reqwest
//! and provides methods for all notifier-server endpoints.
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP test client
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
}

impl TestClient {
    /// Creates a client that sends no admin header.
    ///
    /// Use this for the public API and for testing admin header rejection.
    pub fn new(base_url: String) -> Self {
        Self::with_headers(base_url, HeaderMap::new())
    }

    /// Creates a client acting as ADMIN_USER on every request.
    pub fn admin(base_url: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("X-Admin-User", HeaderValue::from_static(ADMIN_USER));
        Self::with_headers(base_url, headers)
    }

    fn with_headers(base_url: String, headers: HeaderMap) -> Self {
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("GET request failed")
    }

    async fn post(&self, path: &str, body: Value) -> Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("POST request failed")
    }

    async fn put(&self, path: &str, body: Value) -> Response {
        self.client
            .put(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("PUT request failed")
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub async fn health(&self) -> Response {
        self.get("/health").await
    }

    // ========================================================================
    // Job Admin Endpoints
    // ========================================================================

    pub async fn list_templates(&self) -> Response {
        self.get("/v1/admin/job-templates").await
    }

    pub async fn list_jobs(&self) -> Response {
        self.get("/v1/admin/jobs").await
    }

    pub async fn create_job(&self, body: Value) -> Response {
        self.post("/v1/admin/jobs", body).await
    }

    /// Creates a job on `template_type` running every hour. Panics unless it
    /// was created.
    pub async fn create_interval_job(&self, id: &str, template_type: &str, parameters: Value) {
        let response = self
            .create_job(json!({
                "id": id,
                "name": id,
                "template_type": template_type,
                "parameters": parameters,
                "schedule": { "type": "interval", "seconds": 3600 },
            }))
            .await;
        assert_eq!(
            response.status(),
            StatusCode::CREATED,
            "Job creation failed: {:?}",
            response.text().await
        );
    }

    pub async fn get_job(&self, id: &str) -> Response {
        self.get(&format!("/v1/admin/jobs/{}", id)).await
    }

    pub async fn update_job(&self, id: &str, body: Value) -> Response {
        self.put(&format!("/v1/admin/jobs/{}", id), body).await
    }

    pub async fn delete_job(&self, id: &str) -> Response {
        self.client
            .delete(self.url(&format!("/v1/admin/jobs/{}", id)))
            .send()
            .await
            .expect("DELETE request failed")
    }

    pub async fn disable_job(&self, id: &str) -> Response {
        self.post(&format!("/v1/admin/jobs/{}/disable", id), json!({}))
            .await
    }

    pub async fn run_job(&self, id: &str) -> Response {
        self.post(&format!("/v1/admin/jobs/{}/run", id), json!({}))
            .await
    }

    pub async fn get_executions(&self, id: &str) -> Response {
        self.get(&format!("/v1/admin/jobs/{}/executions", id)).await
    }

    /// Triggers `id` and waits until both the execution and the job are no
    /// longer running. Returns the finished execution.
    pub async fn run_job_to_completion(&self, id: &str) -> Value {
        let response = self.run_job(id).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: Value = response.json().await.unwrap();
        let execution_id = body["execution_id"].as_i64().unwrap();

        let start = std::time::Instant::now();
        loop {
            let executions: Value = self.get_executions(id).await.json().await.unwrap();
            let execution = executions
                .as_array()
                .unwrap()
                .iter()
                .find(|e| e["id"].as_i64() == Some(execution_id))
                .cloned();
            if let Some(execution) = execution {
                let job: Value = self.get_job(id).await.json().await.unwrap();
                if execution["status"] != "running" && job["running"] == false {
                    return execution;
                }
            }
            if start.elapsed() > Duration::from_millis(JOB_COMPLETION_TIMEOUT_MS) {
                panic!("Execution {} of {} did not finish", execution_id, id);
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    // ========================================================================
    // Public API Endpoints
    // ========================================================================

    pub async fn post_event(&self, event_type: &str, actor: &str, target: &str, context: Value) -> Response {
        self.post(
            "/v1/events",
            json!({
                "event_type": event_type,
                "actor": actor,
                "target": target,
                "context": context,
            }),
        )
        .await
    }

    pub async fn register_user(&self, username: &str, email: &str) -> Response {
        self.post(
            "/v1/users",
            json!({ "username": username, "email": email, "display_name": username }),
        )
        .await
    }

    /// Registers `username` with quiet hours off, so notifications are never
    /// deferred by the time of day the test runs at.
    pub async fn register_reachable_user(&self, username: &str, email: &str) {
        let response = self.register_user(username, email).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let response = self
            .put_preferences(
                username,
                json!({
                    "quiet_hours": {
                        "enabled": false,
                        "start": "22:00",
                        "end": "08:00",
                        "timezone": "UTC",
                        "exceptions": [],
                    }
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    pub async fn get_preferences(&self, username: &str) -> Response {
        self.get(&format!("/v1/users/{}/preferences", username)).await
    }

    pub async fn put_preferences(&self, username: &str, body: Value) -> Response {
        self.put(&format!("/v1/users/{}/preferences", username), body)
            .await
    }

    // ========================================================================
    // Notification Admin Endpoints
    // ========================================================================

    pub async fn override_target(&self, target: Value, fields: Value, reason: &str) -> Response {
        self.post(
            "/v1/admin/notifications/override",
            json!({ "target": target, "fields": fields, "reason": reason }),
        )
        .await
    }

    pub async fn disable_target(&self, target: Value, reason: &str, notify_user: bool) -> Response {
        self.post(
            "/v1/admin/notifications/disable",
            json!({ "target": target, "reason": reason, "notify_user": notify_user }),
        )
        .await
    }

    pub async fn enable_target(&self, target: Value) -> Response {
        self.post("/v1/admin/notifications/enable", json!({ "target": target }))
            .await
    }

    pub async fn test_target(&self, target: Value, recipient: Option<&str>) -> Response {
        self.post(
            "/v1/admin/notifications/test",
            json!({ "target": target, "recipient": recipient }),
        )
        .await
    }

    pub async fn list_overrides(&self) -> Response {
        self.get("/v1/admin/notifications/overrides").await
    }

    pub async fn audit_log(&self) -> Response {
        self.get("/v1/admin/notifications/audit-log").await
    }

    /// Lists queue entries. `query` is appended verbatim, e.g. "username=alice".
    pub async fn list_queue(&self, query: &str) -> Response {
        self.get(&format!("/v1/admin/notifications/queue?{}", query))
            .await
    }

    pub async fn get_queue_entry(&self, id: i64) -> Response {
        self.get(&format!("/v1/admin/notifications/queue/{}", id))
            .await
    }

    pub async fn queue_entries(&self, query: &str) -> Vec<Value> {
        let response = self.list_queue(query).await;
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }

    pub async fn queue_stats(&self) -> Response {
        self.get("/v1/admin/notifications/stats").await
    }

    pub async fn delivery_log(&self, username: &str) -> Response {
        self.get(&format!("/v1/admin/notifications/log?username={}", username))
            .await
    }
}

/// Target JSON for a user's preference on one trigger.
pub fn trigger_target(username: &str, trigger: &str) -> Value {
    json!({ "type": "trigger_preference", "username": username, "trigger": trigger })
}

/// Target JSON for a user's saved search.
pub fn saved_search_target(username: &str, search_id: &str) -> Value {
    json!({ "type": "saved_search", "username": username, "search_id": search_id })
}
