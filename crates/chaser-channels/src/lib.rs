//! # Chaser Channels
//! Outbound mail transports for chase emails.
//!
//! The scheduler only builds `SendRequest`s; rendering and delivery belong
//! to whatever sits behind the `Mailer` picked here.

pub mod log;
pub mod webhook;

use std::sync::Arc;

use chaser_core::config::{MailerConfig, MailerKind};
use chaser_core::{Mailer, Result};

pub use log::LogMailer;
pub use webhook::WebhookMailer;

/// Build the configured mailer.
pub fn build_mailer(config: &MailerConfig) -> Result<Arc<dyn Mailer>> {
    let mailer: Arc<dyn Mailer> = match config.kind {
        MailerKind::Webhook => Arc::new(WebhookMailer::from_config(config)?),
        MailerKind::Log => Arc::new(LogMailer::new()),
    };
    tracing::info!("📮 Mailer: {}", mailer.name());
    Ok(mailer)
}
