//! Log mailer: writes each send request to the tracing log. The default
//! transport for development and for deployments that are not yet wired to a
//! delivery service.

use async_trait::async_trait;

use chaser_core::{Mailer, Result, SendRequest};

#[derive(Debug, Default, Clone)]
pub struct LogMailer;

impl LogMailer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, request: &SendRequest) -> Result<()> {
        tracing::info!(
            "✉️ [log mailer] {} → {} (send_at {}, {} {:.2})",
            request.idempotency_key,
            request.recipient,
            request.send_at.to_rfc3339(),
            request.invoice.currency,
            request.invoice.amount_cents as f64 / 100.0
        );
        Ok(())
    }
}
