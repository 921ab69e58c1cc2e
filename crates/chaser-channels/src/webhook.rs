//! Webhook mailer: POSTs each send request as JSON to an email delivery
//! service, which owns templates, rendering and the SMTP/provider hop.
//!
//! The idempotency key travels both in the body and in the `Idempotency-Key`
//! header, so a retried send after a lost ledger write can be deduplicated
//! downstream. A `409 Conflict` means the service already accepted that key.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use chaser_core::config::MailerConfig;
use chaser_core::{ChaseError, Mailer, Result, SendRequest};

/// Body of the outbound webhook.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    request: &'a SendRequest,
    sent_by: &'static str,
}

pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl WebhookMailer {
    pub fn new(
        url: impl Into<String>,
        auth_token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ChaseError::config(format!(
                "mailer.webhook_url must be an http(s) URL, got '{url}'"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| ChaseError::config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            url,
            auth_token: auth_token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn from_config(config: &MailerConfig) -> Result<Self> {
        Self::new(
            config.webhook_url.trim(),
            config.auth_token.clone(),
            config.timeout_secs,
        )
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, request: &SendRequest) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&WebhookPayload {
                request,
                sent_by: "chaser",
            });
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ChaseError::mailer(format!("Webhook send failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!("✅ Webhook accepted {} ({status})", request.idempotency_key);
            Ok(())
        } else if status == StatusCode::CONFLICT {
            tracing::info!(
                "♻️ Webhook already has {}, treating as delivered",
                request.idempotency_key
            );
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            Err(ChaseError::mailer(format!("Webhook error {status}: {snippet}")))
        }
    }
}
