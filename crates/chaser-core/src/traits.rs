//! Collaborator interfaces. The scheduler depends on these, never on a
//! concrete store or mail transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{EmailEvent, EmailType, Invoice, Plan, SendRequest, TenantSendHistory};

/// Keyset position inside the candidate ordering `(due_at, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCursor {
    pub due_at: DateTime<Utc>,
    pub invoice_id: String,
}

/// One page request for pending invoices. The due window is a cheap
/// pre-filter only; the resolver makes the real decision.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub due_from: DateTime<Utc>,
    pub due_until: DateTime<Utc>,
    pub after: Option<InvoiceCursor>,
    pub limit: usize,
}

/// Read access to invoices.
#[async_trait]
pub trait InvoiceSource: Send + Sync {
    /// Pending invoices with a due instant inside the window, ordered by `(due_at, id)`.
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Invoice>>;

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>>;
}

/// The append-only email ledger. Reads only ever consider real (non-dry-run) events.
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Whether a real event exists for `(invoice, type[, week])`.
    async fn has_event(
        &self,
        invoice_id: &str,
        email_type: EmailType,
        week_number: Option<u32>,
    ) -> Result<bool>;

    /// Real events of `email_type` recorded for this invoice.
    async fn count_sent(&self, invoice_id: &str, email_type: EmailType) -> Result<u32>;

    /// Last real send and the number of real sends since `day_start` for a tenant.
    async fn tenant_history(
        &self,
        tenant_id: &str,
        day_start: DateTime<Utc>,
    ) -> Result<TenantSendHistory>;

    /// Record one event. A second real event for the same key is
    /// `ChaseError::DuplicateEvent`.
    async fn append(&self, event: &EmailEvent) -> Result<()>;
}

/// Resolves the tenant's current plan.
#[async_trait]
pub trait PlanDirectory: Send + Sync {
    async fn plan_for(&self, tenant_id: &str) -> Result<Plan>;
}

/// Outbound email transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &SendRequest) -> Result<()>;
}
