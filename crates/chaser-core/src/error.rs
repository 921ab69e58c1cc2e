//! Error types shared across the Chaser workspace.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ChaseError>;

/// Every failure the scheduler, its stores and its adapters can report.
#[derive(Debug, Error)]
pub enum ChaseError {
    /// Missing or unsafe configuration. Fails the whole invocation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invoice / tenant store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Ledger read or write failure.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// A real event for this idempotency key already exists.
    #[error("duplicate ledger event: {0}")]
    DuplicateEvent(String),

    /// Outbound mailer rejected or could not be reached.
    #[error("mailer error: {0}")]
    Mailer(String),

    /// A timestamp arrived in a shape that cannot be normalized.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChaseError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    pub fn mailer(msg: impl Into<String>) -> Self {
        Self::Mailer(msg.into())
    }

    /// Configuration problems abort a batch instead of being recorded per invoice.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
