use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use closer_agent::{EscalationNotification, NotificationSender};
use closer_core::config::NotificationConfig;

/// Posts escalation notifications as JSON to an operator webhook.
pub struct WebhookNotificationSender {
    client: Client,
    url: String,
    auth_token: Option<SecretString>,
}

impl WebhookNotificationSender {
    /// `None` when no webhook is configured.
    pub fn from_config(config: &NotificationConfig) -> Result<Option<Self>> {
        let Some(url) = config.webhook_url.clone() else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build notification http client")?;
        Ok(Some(Self { client, url, auth_token: config.auth_token.clone() }))
    }
}

#[async_trait]
impl NotificationSender for WebhookNotificationSender {
    async fn notify(&self, notification: &EscalationNotification) -> Result<()> {
        let mut request = self.client.post(&self.url).json(notification);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send().await.context("notification webhook request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("notification webhook returned {status}"));
        }
        Ok(())
    }
}
