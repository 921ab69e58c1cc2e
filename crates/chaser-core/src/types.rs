//! Domain types: the schedule-relevant projection of invoices, plans and the email ledger.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Invoice lifecycle status as written by the invoice CRUD layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Overdue,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Paid => "paid",
        }
    }

    /// Parse a stored status. Unknown values are `None` and never chased.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(InvoiceStatus::Pending),
            "overdue" => Some(InvoiceStatus::Overdue),
            "paid" => Some(InvoiceStatus::Paid),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An invoice as the scheduler sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    /// Owning tenant (the business paying for a plan).
    pub tenant_id: String,
    pub customer_email: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    /// Amount in minor currency units.
    #[serde(default)]
    pub amount_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// `None` when the stored due date is missing or unparseable.
    pub due_at: Option<DateTime<Utc>>,
    pub status: InvoiceStatus,
    #[serde(default)]
    pub payment_link: Option<String>,
}

fn default_currency() -> String {
    "USD".into()
}

impl Invoice {
    /// Only pending invoices with a customer address are ever chased.
    pub fn is_chaseable(&self) -> bool {
        self.status == InvoiceStatus::Pending && !self.customer_email.trim().is_empty()
    }
}

/// Subscription tier attached to a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Trial,
    Starter,
    Pro,
    Business,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Trial, Plan::Starter, Plan::Pro, Plan::Business];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Trial => "trial",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Business => "business",
        }
    }

    /// Parse a stored plan id. Anything unrecognised falls back to `Trial`,
    /// the most restrictive tier.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" | "free" => Plan::Trial,
            "starter" => Plan::Starter,
            "pro" => Plan::Pro,
            "business" => Plan::Business,
            other => {
                tracing::warn!("⚠️ Unknown plan '{other}', treating as trial");
                Plan::Trial
            }
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of chase email. `Initial` is sent by the invoice creation path and
/// only checked here as a prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    Initial,
    Reminder,
    Due,
    LateWeekly,
}

impl EmailType {
    pub const ALL: [EmailType; 4] = [
        EmailType::Initial,
        EmailType::Reminder,
        EmailType::Due,
        EmailType::LateWeekly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailType::Initial => "initial",
            EmailType::Reminder => "reminder",
            EmailType::Due => "due",
            EmailType::LateWeekly => "late_weekly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(EmailType::Initial),
            "reminder" => Some(EmailType::Reminder),
            "due" => Some(EmailType::Due),
            "late_weekly" | "lateWeekly" => Some(EmailType::LateWeekly),
            _ => None,
        }
    }

    /// Whether events of this type carry a week number.
    pub fn is_weekly(&self) -> bool {
        matches!(self, EmailType::LateWeekly)
    }
}

impl std::fmt::Display for EmailType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key for one (invoice, type[, week]) send.
pub fn idempotency_key(invoice_id: &str, email_type: EmailType, week: Option<u32>) -> String {
    match week {
        Some(w) if email_type.is_weekly() => format!("{invoice_id}:{email_type}:{w}"),
        _ => format!("{invoice_id}:{email_type}"),
    }
}

/// The resolver's answer for one invoice. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub email_type: EmailType,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_number: Option<u32>,
}

impl ScheduleDecision {
    pub fn new(email_type: EmailType, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            email_type,
            scheduled_at,
            week_number: None,
        }
    }

    pub fn late_weekly(week: u32, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            email_type: EmailType::LateWeekly,
            scheduled_at,
            week_number: Some(week),
        }
    }

    /// Due when the scheduled instant falls inside `now + send_ahead`.
    pub fn is_due(&self, now: DateTime<Utc>, send_ahead: Duration) -> bool {
        self.scheduled_at <= now + send_ahead
    }
}

/// Append-only ledger fact: one email actually sent (or simulated).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailEvent {
    pub id: String,
    pub invoice_id: String,
    pub tenant_id: String,
    pub email_type: EmailType,
    #[serde(default)]
    pub week_number: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub dry_run: bool,
}

impl EmailEvent {
    /// Build the ledger entry for a decision acted on at `now`.
    pub fn for_decision(
        invoice: &Invoice,
        decision: &ScheduleDecision,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_id: invoice.id.clone(),
            tenant_id: invoice.tenant_id.clone(),
            email_type: decision.email_type,
            week_number: decision
                .week_number
                .filter(|_| decision.email_type.is_weekly()),
            created_at: now,
            dry_run,
        }
    }

    pub fn key(&self) -> String {
        idempotency_key(&self.invoice_id, self.email_type, self.week_number)
    }
}

/// What the limiter needs to know about a tenant's recent real sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TenantSendHistory {
    pub last_sent_at: Option<DateTime<Utc>>,
    pub sent_today: u32,
}

/// Invoice context handed to the mailer so it can render content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceContext {
    pub invoice_id: String,
    pub tenant_id: String,
    pub invoice_number: Option<String>,
    pub customer_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub due_at: Option<DateTime<Utc>>,
    pub payment_link: Option<String>,
}

/// One outbound email request. The mailer owns rendering and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient: String,
    pub email_type: EmailType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_number: Option<u32>,
    /// Earliest delivery instant; never earlier than the moment the request was built.
    pub send_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub invoice: InvoiceContext,
}

impl SendRequest {
    pub fn build(invoice: &Invoice, decision: &ScheduleDecision, now: DateTime<Utc>) -> Self {
        Self {
            recipient: invoice.customer_email.trim().to_string(),
            email_type: decision.email_type,
            week_number: decision.week_number,
            send_at: decision.scheduled_at.max(now),
            idempotency_key: idempotency_key(
                &invoice.id,
                decision.email_type,
                decision.week_number,
            ),
            invoice: InvoiceContext {
                invoice_id: invoice.id.clone(),
                tenant_id: invoice.tenant_id.clone(),
                invoice_number: invoice.invoice_number.clone(),
                customer_name: invoice.customer_name.clone(),
                amount_cents: invoice.amount_cents,
                currency: invoice.currency.clone(),
                due_at: invoice.due_at,
                payment_link: invoice.payment_link.clone(),
            },
        }
    }
}
