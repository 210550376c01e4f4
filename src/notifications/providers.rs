//! External collaborators of the delivery pipeline: channel providers and
//! the PII decryptor.

use super::models::Channel;
use crate::config::{ProviderSettings, ProvidersSettings};
use anyhow::Result;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("provider unreachable: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("field is encrypted and cannot be decrypted here")]
    OpaqueCiphertext,
    #[error("decryption failed: {0}")]
    Failed(String),
}

/// Sends a rendered message on one channel.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait ChannelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        metadata: &JsonValue,
    ) -> Result<(), ProviderError>;
}

/// Decrypts contact fields that may be encrypted at rest. Must return
/// plaintext input unchanged.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait PiiDecryptor: Send + Sync {
    fn decrypt(&self, field: &str) -> Result<String, DecryptionError>;
}

/// Accepts every message and only logs it.
pub struct LogOnlyProvider {
    channel: Channel,
}

impl LogOnlyProvider {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl ChannelProvider for LogOnlyProvider {
    fn name(&self) -> &str {
        "log_only"
    }

    fn send(
        &self,
        recipient: &str,
        subject: &str,
        _body: &str,
        metadata: &JsonValue,
    ) -> Result<(), ProviderError> {
        info!(
            "[{}] to={} subject={:?} entry={}",
            self.channel.as_str(),
            recipient,
            subject,
            metadata.get("entryId").cloned().unwrap_or(JsonValue::Null)
        );
        Ok(())
    }
}

/// POSTs each message as JSON to a webhook. Must be called from a blocking
/// thread of a tokio runtime (job executions run there).
pub struct WebhookProvider {
    channel: Channel,
    client: Client,
    url: String,
}

impl WebhookProvider {
    pub fn new(channel: Channel, url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            channel,
            client,
            url,
        })
    }

    async fn post(&self, payload: JsonValue) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(ProviderError::Transport(format!("HTTP {}: {}", status, text)))
        } else {
            Err(ProviderError::Rejected(format!("HTTP {}: {}", status, text)))
        }
    }
}

impl ChannelProvider for WebhookProvider {
    fn name(&self) -> &str {
        "webhook"
    }

    fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        metadata: &JsonValue,
    ) -> Result<(), ProviderError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ProviderError::Transport(format!("no runtime: {}", e)))?;
        let payload = json!({
            "channel": self.channel.as_str(),
            "recipient": recipient,
            "subject": subject,
            "body": body,
            "metadata": metadata,
        });
        handle.block_on(self.post(payload))
    }
}

/// Treats every field as plaintext. Values carrying the ciphertext marker
/// are rejected instead of being sent as garbage.
pub struct PlaintextDecryptor;

const CIPHERTEXT_PREFIX: &str = "gAAAAA";

impl PiiDecryptor for PlaintextDecryptor {
    fn decrypt(&self, field: &str) -> Result<String, DecryptionError> {
        if field.starts_with(CIPHERTEXT_PREFIX) {
            return Err(DecryptionError::OpaqueCiphertext);
        }
        Ok(field.to_string())
    }
}

/// The provider used for each channel.
#[derive(Clone)]
pub struct ChannelProviders {
    pub email: Arc<dyn ChannelProvider>,
    pub sms: Arc<dyn ChannelProvider>,
    pub push: Arc<dyn ChannelProvider>,
}

impl ChannelProviders {
    pub fn log_only() -> Self {
        Self {
            email: Arc::new(LogOnlyProvider::new(Channel::Email)),
            sms: Arc::new(LogOnlyProvider::new(Channel::Sms)),
            push: Arc::new(LogOnlyProvider::new(Channel::Push)),
        }
    }

    pub fn from_settings(settings: &ProvidersSettings) -> Result<Self> {
        Ok(Self {
            email: provider_for(Channel::Email, &settings.email)?,
            sms: provider_for(Channel::Sms, &settings.sms)?,
            push: provider_for(Channel::Push, &settings.push)?,
        })
    }

    pub fn for_channel(&self, channel: Channel) -> &Arc<dyn ChannelProvider> {
        match channel {
            Channel::Email => &self.email,
            Channel::Sms => &self.sms,
            Channel::Push => &self.push,
        }
    }
}

fn provider_for(channel: Channel, settings: &ProviderSettings) -> Result<Arc<dyn ChannelProvider>> {
    Ok(match &settings.webhook_url {
        Some(url) => {
            info!("{} notifications go to webhook {}", channel.as_str(), url);
            Arc::new(WebhookProvider::new(channel, url.clone(), settings.timeout_secs)?)
        }
        None => {
            info!("{} notifications use the log-only provider", channel.as_str());
            Arc::new(LogOnlyProvider::new(channel))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_decryptor_is_idempotent() {
        let decryptor = PlaintextDecryptor;
        let once = decryptor.decrypt("alice@example.com").unwrap();
        assert_eq!(decryptor.decrypt(&once).unwrap(), "alice@example.com");
        assert_eq!(
            decryptor.decrypt("gAAAAABlZ2V0dGluZw=="),
            Err(DecryptionError::OpaqueCiphertext)
        );
    }

    #[test]
    fn test_providers_from_settings() {
        let providers = ChannelProviders::from_settings(&ProvidersSettings {
            sms: ProviderSettings {
                webhook_url: Some("http://127.0.0.1:1/sms".to_string()),
                timeout_secs: 1,
            },
            ..Default::default()
        })
        .unwrap();
        assert_eq!(providers.for_channel(Channel::Email).name(), "log_only");
        assert_eq!(providers.for_channel(Channel::Sms).name(), "webhook");
    }

    #[test]
    fn test_webhook_without_runtime_fails_as_transport() {
        let provider =
            WebhookProvider::new(Channel::Email, "http://127.0.0.1:1/".to_string(), 1).unwrap();
        let err = provider
            .send("a@b.c", "s", "b", &JsonValue::Null)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_webhook_unreachable_is_transport_error() {
        let provider =
            WebhookProvider::new(Channel::Email, "http://127.0.0.1:1/".to_string(), 1).unwrap();
        let result = tokio::task::spawn_blocking(move || {
            provider.send("a@b.c", "s", "b", &JsonValue::Null)
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(ProviderError::Transport(_))));
    }

    /// Serves `/ok`, `/bad` and `/down` on a random local port. `/ok` records
    /// the payloads it receives.
    async fn spawn_webhook_receiver() -> (String, Arc<std::sync::Mutex<Vec<JsonValue>>>) {
        use axum::http::StatusCode;
        use axum::routing::post;
        use axum::{extract::State, Json, Router};

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/ok",
                post(
                    |State(received): State<Arc<std::sync::Mutex<Vec<JsonValue>>>>,
                     Json(payload): Json<JsonValue>| async move {
                        received.lock().unwrap().push(payload);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .route("/bad", post(|| async { (StatusCode::BAD_REQUEST, "unknown recipient") }))
            .route("/down", post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), received)
    }

    async fn send_to(url: String) -> Result<(), ProviderError> {
        let provider = WebhookProvider::new(Channel::Sms, url, 5).unwrap();
        tokio::task::spawn_blocking(move || {
            provider.send("+15550100", "Hi", "body", &json!({"entryId": 7}))
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_webhook_status_classification() {
        let (base, received) = spawn_webhook_receiver().await;

        send_to(format!("{}/ok", base)).await.unwrap();
        let payloads = received.lock().unwrap().clone();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["channel"], "sms");
        assert_eq!(payloads[0]["recipient"], "+15550100");
        assert_eq!(payloads[0]["metadata"]["entryId"], 7);

        match send_to(format!("{}/bad", base)).await {
            Err(ProviderError::Rejected(message)) => {
                assert!(message.contains("400"));
                assert!(message.contains("unknown recipient"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        match send_to(format!("{}/down", base)).await {
            Err(ProviderError::Transport(message)) => assert!(message.contains("503")),
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}
