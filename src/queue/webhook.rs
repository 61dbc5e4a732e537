use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::queue::EventPayload;

/// Outcome of one delivery attempt: the HTTP status, or `None` if no response arrived.
pub type DeliveryStatus = Option<u16>;

#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, url: &str, payload: &EventPayload) -> DeliveryStatus;
}

/// JSON POST with a bearer token.
pub struct HttpWebhook {
    client: Client,
    token: String,
}

impl HttpWebhook {
    pub fn new(token: impl Into<String>, timeout: Duration) -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| eyre::eyre!("Failed to build webhook HTTP client: {}", e))?;
        Ok(Self {
            client,
            token: token.into(),
        })
    }
}

#[async_trait]
impl WebhookSink for HttpWebhook {
    async fn deliver(&self, url: &str, payload: &EventPayload) -> DeliveryStatus {
        match self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
        {
            Ok(resp) => Some(resp.status().as_u16()),
            Err(e) => {
                tracing::warn!(url, tx = %payload.hash, error = %e, "Webhook request failed");
                None
            }
        }
    }
}

pub fn is_success(status: DeliveryStatus) -> bool {
    matches!(status, Some(code) if (200..300).contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_any_2xx() {
        assert!(is_success(Some(200)));
        assert!(is_success(Some(204)));
        assert!(!is_success(Some(500)));
        assert!(!is_success(Some(302)));
        assert!(!is_success(None));
    }
}
