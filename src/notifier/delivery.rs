use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::NotifierConfig;
use crate::error::{PipelineError, Result};

/// One outgoing report email.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

/// Delivery backend for report emails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// HTTP mail gateway provider. Authenticates with an API key read from the
/// environment and posts the message as JSON.
#[derive(Debug)]
pub struct MailGateway {
    client: Client,
    gateway_url: String,
    api_key: String,
}

impl MailGateway {
    pub fn new(config: &NotifierConfig) -> Result<Self> {
        let gateway_url = config.gateway_url.clone().ok_or_else(|| {
            PipelineError::ConfigError(
                "gateway_url is required when send_email is enabled".to_string(),
            )
        })?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            PipelineError::ConfigError(format!(
                "mail gateway API key not found in environment variable {}",
                config.api_key_env
            ))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                PipelineError::NetworkError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            gateway_url,
            api_key,
        })
    }

    async fn post_message(&self, payload: Value) -> Result<()> {
        let response = self
            .client
            .post(&self.gateway_url)
            .header("X-Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                PipelineError::NetworkError(format!("Failed to reach mail gateway: {}", e))
            })?;

        if response.status().is_success() {
            debug!("Mail gateway accepted the message");
        } else if response.status().as_u16() == 429 {
            // Rate limited, wait and retry
            warn!("Mail gateway rate limited, waiting...");
            sleep(Duration::from_secs(2)).await;
            return Box::pin(self.post_message(payload)).await;
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Box::new(PipelineError::ApiError(format!(
                "Mail gateway rejected the message with status {}: {}",
                status, body
            ))));
        }

        Ok(())
    }
}

#[async_trait]
impl DeliveryProvider for MailGateway {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let payload = json!({
            "from": message.from,
            "to": message.to,
            "subject": message.subject,
            "html": message.html_body,
        });
        self.post_message(payload).await
    }
}

/// Sends through the provider with up to 3 attempts, doubling the wait
/// between attempts starting at 2 seconds.
pub async fn deliver_with_retry(
    provider: &dyn DeliveryProvider,
    message: &EmailMessage,
) -> Result<()> {
    const MAX_ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_secs(2);

    for attempt in 1..=MAX_ATTEMPTS {
        match provider.send(message).await {
            Ok(()) => {
                info!("Report email sent to {}", message.to);
                return Ok(());
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(
                    "Email delivery attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, MAX_ATTEMPTS, e, delay
                );
                sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                return Err(Box::new(PipelineError::NetworkError(format!(
                    "Email delivery failed after {} attempts: {}",
                    MAX_ATTEMPTS, e
                ))));
            }
        }
    }
    unreachable!("delivery loop returns on success or final failure")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> EmailMessage {
        EmailMessage {
            from: "pipeline@example.com".to_string(),
            to: "me@example.com".to_string(),
            subject: "Daily Job Report".to_string(),
            html_body: "<html></html>".to_string(),
        }
    }

    #[tokio::test]
    async fn delivery_succeeds_first_try() {
        let mut provider = MockDeliveryProvider::new();
        provider.expect_send().times(1).returning(|_| Ok(()));

        deliver_with_retry(&provider, &message()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_retries_then_succeeds() {
        let mut provider = MockDeliveryProvider::new();
        let mut calls = 0;
        provider.expect_send().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(Box::new(PipelineError::NetworkError(
                    "connection reset".to_string(),
                )) as _)
            } else {
                Ok(())
            }
        });

        deliver_with_retry(&provider, &message()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_gives_up_after_three_attempts() {
        let mut provider = MockDeliveryProvider::new();
        provider.expect_send().times(3).returning(|_| {
            Err(Box::new(PipelineError::NetworkError("timeout".to_string())) as _)
        });

        let err = deliver_with_retry(&provider, &message())
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("after 3 attempts"));
    }

    #[test]
    fn gateway_requires_url_and_key() {
        let mut config = crate::config::Config::default().notifier;
        config.gateway_url = None;
        let err = MailGateway::new(&config).unwrap_err().to_string();
        assert!(err.contains("gateway_url"));

        config.gateway_url = Some("https://mail.example.com/send".to_string());
        config.api_key_env = "MAIL_GATEWAY_TEST_KEY_THAT_IS_UNSET".to_string();
        let err = MailGateway::new(&config).unwrap_err().to_string();
        assert!(err.contains("MAIL_GATEWAY_TEST_KEY_THAT_IS_UNSET"));
    }
}
