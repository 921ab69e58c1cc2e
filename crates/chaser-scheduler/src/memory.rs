//! In-memory collaborators: invoices, ledger, plans and a recording mailer.
//! Used by tests and by dry runs that must not touch a real store.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chaser_core::{
    CandidateQuery, ChaseError, EmailEvent, EmailType, EventLedger, Invoice, InvoiceSource,
    InvoiceStatus, Mailer, Plan, PlanDirectory, Result, SendRequest, TenantSendHistory,
};

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Invoice source, event ledger and plan directory over plain collections.
#[derive(Default)]
pub struct MemoryStore {
    invoices: Mutex<HashMap<String, Invoice>>,
    events: Mutex<Vec<EmailEvent>>,
    plans: Mutex<HashMap<String, Plan>>,
    failing_appends: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_invoice(&self, invoice: Invoice) {
        guard(&self.invoices).insert(invoice.id.clone(), invoice);
    }

    pub fn set_status(&self, invoice_id: &str, status: InvoiceStatus) {
        if let Some(inv) = guard(&self.invoices).get_mut(invoice_id) {
            inv.status = status;
        }
    }

    pub fn set_plan(&self, tenant_id: &str, plan: Plan) {
        guard(&self.plans).insert(tenant_id.to_string(), plan);
    }

    /// Push an event straight into the ledger, skipping the duplicate check.
    pub fn record(&self, event: EmailEvent) {
        guard(&self.events).push(event);
    }

    /// Make every future append for this invoice fail.
    pub fn fail_appends_for(&self, invoice_id: &str) {
        guard(&self.failing_appends).insert(invoice_id.to_string());
    }

    pub fn events(&self) -> Vec<EmailEvent> {
        guard(&self.events).clone()
    }

    pub fn real_events_for(&self, invoice_id: &str) -> Vec<EmailEvent> {
        guard(&self.events)
            .iter()
            .filter(|e| e.invoice_id == invoice_id && !e.dry_run)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InvoiceSource for MemoryStore {
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Invoice>> {
        let mut page: Vec<(DateTime<Utc>, Invoice)> = guard(&self.invoices)
            .values()
            .filter(|inv| inv.status == InvoiceStatus::Pending)
            .filter_map(|inv| inv.due_at.map(|d| (d, inv.clone())))
            .filter(|(d, _)| *d >= query.due_from && *d <= query.due_until)
            .filter(|(d, inv)| match &query.after {
                Some(c) => (*d, inv.id.as_str()) > (c.due_at, c.invoice_id.as_str()),
                None => true,
            })
            .collect();
        page.sort_by(|(da, a), (db, b)| (da, &a.id).cmp(&(db, &b.id)));
        Ok(page
            .into_iter()
            .take(query.limit)
            .map(|(_, inv)| inv)
            .collect())
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
        Ok(guard(&self.invoices).get(invoice_id).cloned())
    }
}

#[async_trait]
impl EventLedger for MemoryStore {
    async fn has_event(
        &self,
        invoice_id: &str,
        email_type: EmailType,
        week_number: Option<u32>,
    ) -> Result<bool> {
        Ok(guard(&self.events).iter().any(|e| {
            !e.dry_run
                && e.invoice_id == invoice_id
                && e.email_type == email_type
                && (!email_type.is_weekly() || e.week_number == week_number)
        }))
    }

    async fn count_sent(&self, invoice_id: &str, email_type: EmailType) -> Result<u32> {
        Ok(guard(&self.events)
            .iter()
            .filter(|e| !e.dry_run && e.invoice_id == invoice_id && e.email_type == email_type)
            .count() as u32)
    }

    async fn tenant_history(
        &self,
        tenant_id: &str,
        day_start: DateTime<Utc>,
    ) -> Result<TenantSendHistory> {
        let events = guard(&self.events);
        let real = events
            .iter()
            .filter(|e| !e.dry_run && e.tenant_id == tenant_id);
        let mut history = TenantSendHistory::default();
        for e in real {
            history.last_sent_at = history.last_sent_at.max(Some(e.created_at));
            if e.created_at >= day_start {
                history.sent_today += 1;
            }
        }
        Ok(history)
    }

    async fn append(&self, event: &EmailEvent) -> Result<()> {
        if guard(&self.failing_appends).contains(&event.invoice_id) {
            return Err(ChaseError::ledger(format!(
                "simulated write failure for {}",
                event.key()
            )));
        }
        let mut events = guard(&self.events);
        if !event.dry_run
            && events
                .iter()
                .any(|e| !e.dry_run && e.key() == event.key())
        {
            return Err(ChaseError::DuplicateEvent(event.key()));
        }
        events.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl PlanDirectory for MemoryStore {
    async fn plan_for(&self, tenant_id: &str) -> Result<Plan> {
        Ok(guard(&self.plans)
            .get(tenant_id)
            .copied()
            .unwrap_or(Plan::Trial))
    }
}

/// Mailer that records requests instead of delivering them.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SendRequest>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every send for this invoice.
    pub fn fail_for(&self, invoice_id: &str) {
        guard(&self.failing).insert(invoice_id.to_string());
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, request: &SendRequest) -> Result<()> {
        if guard(&self.failing).contains(&request.invoice.invoice_id) {
            return Err(ChaseError::mailer(format!(
                "provider rejected {}",
                request.idempotency_key
            )));
        }
        guard(&self.sent).push(request.clone());
        Ok(())
    }
}
