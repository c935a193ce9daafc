//! Transactional-provider delivery over its HTTP API.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::inbound::normalize_message_id;
use crate::outbound::{Mailer, SendReceipt};
use crate::tracking::PixelAttachment;

/// Sends mail through the provider's `/messages` endpoint with the
/// provider's own open/click tracking enabled alongside ours.
pub struct HttpApiMailer {
    config: DeliveryConfig,
    client: reqwest::Client,
}

impl HttpApiMailer {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn post_message(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<String> {
        let url = format!("{}/{}/messages", self.config.api_base, self.config.domain);
        let params = [
            ("from", self.config.from_address.as_str()),
            ("to", to),
            ("subject", subject),
            ("html", html),
            ("o:tracking", "yes"),
            ("o:tracking-clicks", "yes"),
            ("o:tracking-opens", "yes"),
            ("h:Reply-To", self.config.from_address.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(self.config.api_key.expose_secret()))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("provider returned {status}");
        }

        let body: serde_json::Value = response.json().await?;
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("response missing message id"))?;

        Ok(normalize_message_id(id))
    }
}

#[async_trait]
impl Mailer for HttpApiMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        _pixel: Option<&PixelAttachment>,
    ) -> Result<SendReceipt, DeliveryError> {
        // The pixel reference rides inside the html itself; this endpoint
        // takes no inline attachments.
        let message_id = self
            .post_message(to, subject, html)
            .await
            .map_err(|e| DeliveryError::RequestFailed(e.to_string()))?;

        info!(recipient = %to, message_id = %message_id, "Provider accepted message");
        Ok(SendReceipt { message_id })
    }
}
