//! Chase dispatcher: one invocation pages through pending invoices and, for
//! each, resolves the next email, gates it through the plan limiter, hands it
//! to the mailer and records the ledger event.
//!
//! ```text
//! run_batch(now)
//!   ├── candidates(window, cursor, limit)        one keyset page
//!   └── per invoice (bounded parallelism, tenant lock held):
//!         resolve → due? → gate → send → append
//! ```
//!
//! A failure on one invoice never aborts the batch; only fetching the page can.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use tokio::sync::Mutex;

use chaser_core::config::DispatchConfig;
use chaser_core::{
    BusinessClock, CandidateQuery, ChaseError, ChaserConfig, EmailEvent, EmailType, EventLedger,
    Invoice, InvoiceCursor, InvoiceSource, InvoiceStatus, Mailer, PlanDirectory, Result,
    ScheduleDecision, SendRequest,
};

use crate::limits::{DenyReason, Gate, PlanLimiter, SendCheck};
use crate::locks::TenantLocks;
use crate::resolver::ScheduleResolver;

/// Resolved dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub send_ahead: Duration,
    pub lookback: Duration,
    pub lookahead: Duration,
    pub dry_run: bool,
}

impl DispatchSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.effective_batch_size(),
            concurrency: config.effective_concurrency(),
            send_ahead: Duration::minutes(config.send_ahead_minutes.max(0)),
            lookback: Duration::days(config.lookback_days.max(0)),
            lookahead: Duration::days(config.lookahead_days.max(0)),
            dry_run: config.dry_run,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// The stores and transport a dispatcher works against.
#[derive(Clone)]
pub struct Collaborators {
    pub invoices: Arc<dyn InvoiceSource>,
    pub ledger: Arc<dyn EventLedger>,
    pub plans: Arc<dyn PlanDirectory>,
    pub mailer: Arc<dyn Mailer>,
}

impl Collaborators {
    /// All three store roles served by one backend.
    pub fn from_store<S>(store: Arc<S>, mailer: Arc<dyn Mailer>) -> Self
    where
        S: InvoiceSource + EventLedger + PlanDirectory + 'static,
    {
        Self {
            invoices: store.clone(),
            ledger: store.clone(),
            plans: store,
            mailer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotPending,
    MissingCustomerEmail,
    MissingDueDate,
    NothingOwed,
}

/// Where in the pipeline an invoice failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Resolve,
    Gate,
    Send,
    /// Dry-run ledger write.
    Ledger,
    /// The email went out but was not recorded. Duplicate risk.
    LedgerAfterSend,
}

/// Result for one invoice in a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Sent {
        decision: ScheduleDecision,
    },
    DryRun {
        decision: ScheduleDecision,
    },
    Deferred {
        decision: ScheduleDecision,
    },
    Skipped {
        reason: SkipReason,
    },
    RateLimited {
        decision: ScheduleDecision,
        reason: DenyReason,
    },
    Failed {
        stage: FailureStage,
        error: String,
        /// The ledger already held a real event for this key.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        duplicate: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        decision: Option<ScheduleDecision>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceOutcome {
    pub invoice_id: String,
    pub tenant_id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Summary of one `run_batch` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_at: DateTime<Utc>,
    pub dry_run: bool,
    pub fetched: usize,
    pub sent: usize,
    pub dry_runs: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub rate_limited: usize,
    pub failed: usize,
    /// The page ended the rotation; the next batch starts from the beginning.
    pub cursor_reset: bool,
    pub elapsed_ms: u64,
    pub outcomes: Vec<InvoiceOutcome>,
}

impl BatchReport {
    fn new(run_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_at,
            dry_run,
            fetched: 0,
            sent: 0,
            dry_runs: 0,
            deferred: 0,
            skipped: 0,
            rate_limited: 0,
            failed: 0,
            cursor_reset: false,
            elapsed_ms: 0,
            outcomes: Vec::new(),
        }
    }

    fn push(&mut self, item: InvoiceOutcome) {
        match &item.outcome {
            Outcome::Sent { .. } => self.sent += 1,
            Outcome::DryRun { .. } => self.dry_runs += 1,
            Outcome::Deferred { .. } => self.deferred += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::RateLimited { .. } => self.rate_limited += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(item);
    }

    pub fn summary(&self) -> String {
        format!(
            "fetched={} sent={} dry_run={} deferred={} skipped={} rate_limited={} failed={} ({}ms)",
            self.fetched,
            self.sent,
            self.dry_runs,
            self.deferred,
            self.skipped,
            self.rate_limited,
            self.failed,
            self.elapsed_ms
        )
    }
}

/// Result of a manual single-invoice chase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ManualOutcome {
    Sent {
        decision: ScheduleDecision,
    },
    DryRun {
        decision: ScheduleDecision,
    },
    InvoiceNotFound,
    InvoiceNotPending {
        status: InvoiceStatus,
    },
    MissingCustomerEmail,
    InitialEmailRequired,
    NothingDue {
        next_at: Option<DateTime<Utc>>,
        email_type: Option<EmailType>,
    },
    RateLimited {
        reason: DenyReason,
    },
    SendFailed {
        error: String,
    },
    LedgerWriteFailed {
        error: String,
    },
}

impl ManualOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            ManualOutcome::Sent { .. } => "sent",
            ManualOutcome::DryRun { .. } => "dry_run",
            ManualOutcome::InvoiceNotFound => "invoice_not_found",
            ManualOutcome::InvoiceNotPending { .. } => "invoice_not_pending",
            ManualOutcome::MissingCustomerEmail => "missing_customer_email",
            ManualOutcome::InitialEmailRequired => "initial_email_required",
            ManualOutcome::NothingDue { .. } => "nothing_due",
            ManualOutcome::RateLimited { .. } => "rate_limited",
            ManualOutcome::SendFailed { .. } => "send_failed",
            ManualOutcome::LedgerWriteFailed { .. } => "ledger_write_failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ManualOutcome::Sent { .. } | ManualOutcome::DryRun { .. })
    }
}

/// Full timeline plus the ledger-aware next step for one invoice.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulePreview {
    pub invoice_id: String,
    pub status: InvoiceStatus,
    pub due_at: Option<DateTime<Utc>>,
    pub next: Option<ScheduleDecision>,
    pub timeline: Vec<ScheduleDecision>,
}

/// Non-failure results of the per-invoice pipeline.
enum Attempt {
    Sent(ScheduleDecision),
    DryRun(ScheduleDecision),
    Deferred(ScheduleDecision),
    Skipped(SkipReason),
    RateLimited(ScheduleDecision, DenyReason),
}

struct StageError {
    stage: FailureStage,
    error: ChaseError,
    decision: Option<ScheduleDecision>,
}

impl StageError {
    fn new(stage: FailureStage, error: ChaseError, decision: Option<ScheduleDecision>) -> Self {
        Self {
            stage,
            error,
            decision,
        }
    }
}

fn skip_reason(invoice: &Invoice) -> Option<SkipReason> {
    if invoice.status != InvoiceStatus::Pending {
        Some(SkipReason::NotPending)
    } else if invoice.customer_email.trim().is_empty() {
        Some(SkipReason::MissingCustomerEmail)
    } else if invoice.due_at.is_none() {
        Some(SkipReason::MissingDueDate)
    } else {
        None
    }
}

/// Runs chase batches and manual chases against a set of collaborators.
pub struct Dispatcher {
    invoices: Arc<dyn InvoiceSource>,
    ledger: Arc<dyn EventLedger>,
    plans: Arc<dyn PlanDirectory>,
    mailer: Arc<dyn Mailer>,
    resolver: ScheduleResolver,
    limiter: PlanLimiter,
    settings: DispatchSettings,
    tenant_locks: TenantLocks,
    cursor: Mutex<Option<InvoiceCursor>>,
}

impl Dispatcher {
    pub fn new(
        collaborators: Collaborators,
        clock: BusinessClock,
        limiter: PlanLimiter,
        settings: DispatchSettings,
    ) -> Self {
        let Collaborators {
            invoices,
            ledger,
            plans,
            mailer,
        } = collaborators;
        Self {
            resolver: ScheduleResolver::new(clock, ledger.clone()),
            invoices,
            ledger,
            plans,
            mailer,
            limiter,
            settings,
            tenant_locks: TenantLocks::new(),
            cursor: Mutex::new(None),
        }
    }

    /// Build from a validated config. Configuration errors surface here.
    pub fn from_config(config: &ChaserConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            collaborators,
            config.business_clock()?,
            PlanLimiter::from_config(config)?,
            DispatchSettings::from_config(&config.dispatch),
        ))
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &ScheduleResolver {
        &self.resolver
    }

    pub fn mailer_name(&self) -> &str {
        self.mailer.name()
    }

    /// Process one page of candidate invoices.
    pub async fn run_batch(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let started = std::time::Instant::now();
        let mut report = BatchReport::new(now, self.settings.dry_run);
        let page = self.next_page(now, &mut report).await?;
        report.fetched = page.len();

        let outcomes: Vec<InvoiceOutcome> = stream::iter(page)
            .map(|invoice| self.process(invoice, now))
            .buffered(self.settings.concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            report.push(outcome);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if report.failed > 0 {
            tracing::warn!("⚠️ Chase batch finished with failures: {}", report.summary());
        } else {
            tracing::info!("📬 Chase batch: {}", report.summary());
        }
        Ok(report)
    }

    /// Fetch the page after the stored cursor and advance it. A short page
    /// resets the rotation; an empty resumed page restarts from the beginning.
    async fn next_page(
        &self,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) -> Result<Vec<Invoice>> {
        let limit = self.settings.batch_size;
        let mut cursor = self.cursor.lock().await;
        let mut query = CandidateQuery {
            due_from: now - self.settings.lookback,
            due_until: now + self.settings.lookahead,
            after: cursor.clone(),
            limit,
        };
        let mut page = self.invoices.candidates(&query).await?;
        if page.is_empty() && query.after.is_some() {
            query.after = None;
            page = self.invoices.candidates(&query).await?;
        }

        report.cursor_reset = page.len() < limit;
        *cursor = if report.cursor_reset {
            None
        } else {
            page.last().and_then(|inv| {
                inv.due_at.map(|due_at| InvoiceCursor {
                    due_at,
                    invoice_id: inv.id.clone(),
                })
            })
        };
        tracing::debug!(
            "Fetched {} candidates (after={:?}, reset={})",
            page.len(),
            query.after.as_ref().map(|c| c.invoice_id.as_str()),
            report.cursor_reset
        );
        Ok(page)
    }

    async fn process(&self, invoice: Invoice, now: DateTime<Utc>) -> InvoiceOutcome {
        let outcome = match self.attempt(&invoice, now).await {
            Ok(Attempt::Sent(decision)) => Outcome::Sent { decision },
            Ok(Attempt::DryRun(decision)) => Outcome::DryRun { decision },
            Ok(Attempt::Deferred(decision)) => Outcome::Deferred { decision },
            Ok(Attempt::Skipped(reason)) => Outcome::Skipped { reason },
            Ok(Attempt::RateLimited(decision, reason)) => Outcome::RateLimited { decision, reason },
            Err(e) => Outcome::Failed {
                stage: e.stage,
                duplicate: matches!(e.error, ChaseError::DuplicateEvent(_)),
                error: e.error.to_string(),
                decision: e.decision,
            },
        };
        InvoiceOutcome {
            invoice_id: invoice.id,
            tenant_id: invoice.tenant_id,
            outcome,
        }
    }

    /// resolve → due? → gate → send → append, under the tenant lock.
    async fn attempt(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> std::result::Result<Attempt, StageError> {
        if let Some(reason) = skip_reason(invoice) {
            return Ok(Attempt::Skipped(reason));
        }
        let _tenant = self.tenant_locks.lock(&invoice.tenant_id).await;

        let decision = match self.resolver.next_email_for(invoice, now).await {
            Ok(Some(d)) => d,
            Ok(None) => return Ok(Attempt::Skipped(SkipReason::NothingOwed)),
            Err(e) => {
                tracing::warn!("⚠️ Resolve failed for invoice {}: {e}", invoice.id);
                return Err(StageError::new(FailureStage::Resolve, e, None));
            }
        };
        if !decision.is_due(now, self.settings.send_ahead) {
            return Ok(Attempt::Deferred(decision));
        }

        match self.gate(invoice, &decision, now).await {
            Ok(Gate::Allow) => {}
            Ok(Gate::Deny(reason)) => {
                tracing::info!(
                    "⏳ {} for invoice {} rate limited: {reason}",
                    decision.email_type,
                    invoice.id
                );
                return Ok(Attempt::RateLimited(decision, reason));
            }
            Err(e) => {
                tracing::warn!("⚠️ Limiter inputs unavailable for invoice {}: {e}", invoice.id);
                return Err(StageError::new(FailureStage::Gate, e, Some(decision)));
            }
        }

        let event = EmailEvent::for_decision(invoice, &decision, now, self.settings.dry_run);
        if self.settings.dry_run {
            if let Err(e) = self.ledger.append(&event).await {
                tracing::warn!("⚠️ Dry-run event for {} not recorded: {e}", event.key());
                return Err(StageError::new(FailureStage::Ledger, e, Some(decision)));
            }
            tracing::info!("🧪 [dry run] would send {} to invoice {}", event.key(), invoice.id);
            return Ok(Attempt::DryRun(decision));
        }

        let request = SendRequest::build(invoice, &decision, now);
        if let Err(e) = self.mailer.send(&request).await {
            tracing::warn!(
                "⚠️ {} failed via {}: {e}",
                request.idempotency_key,
                self.mailer.name()
            );
            return Err(StageError::new(FailureStage::Send, e, Some(decision)));
        }

        if let Err(e) = self.ledger.append(&event).await {
            tracing::error!(
                "🚨 {} was sent via {} but the ledger write failed, it may be sent again: {e}",
                request.idempotency_key,
                self.mailer.name()
            );
            return Err(StageError::new(FailureStage::LedgerAfterSend, e, Some(decision)));
        }

        tracing::info!(
            "📧 Sent {} to {} (send_at {})",
            request.idempotency_key,
            request.recipient,
            request.send_at.to_rfc3339()
        );
        Ok(Attempt::Sent(decision))
    }

    async fn gate(
        &self,
        invoice: &Invoice,
        decision: &ScheduleDecision,
        now: DateTime<Utc>,
    ) -> Result<Gate> {
        let plan = self.plans.plan_for(&invoice.tenant_id).await?;
        let day_start = self.resolver.clock().day_start(now);
        let history = self
            .ledger
            .tenant_history(&invoice.tenant_id, day_start)
            .await?;
        let sent_for_type = self
            .ledger
            .count_sent(&invoice.id, decision.email_type)
            .await?;
        Ok(self.limiter.can_send(&SendCheck {
            plan,
            history: &history,
            sent_for_type,
            email_type: decision.email_type,
            week_number: decision.week_number,
            now,
        }))
    }

    /// Chase one invoice on request. Only store failures while resolving or
    /// gating are errors; everything else is a `ManualOutcome`.
    pub async fn chase_one(
        &self,
        invoice_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ManualOutcome> {
        let Some(invoice) = self.invoices.get_invoice(invoice_id).await? else {
            return Ok(ManualOutcome::InvoiceNotFound);
        };
        if invoice.tenant_id != tenant_id {
            tracing::debug!("Invoice {invoice_id} is not owned by tenant {tenant_id}");
            return Ok(ManualOutcome::InvoiceNotFound);
        }
        if invoice.status != InvoiceStatus::Pending {
            return Ok(ManualOutcome::InvoiceNotPending {
                status: invoice.status,
            });
        }
        if invoice.customer_email.trim().is_empty() {
            return Ok(ManualOutcome::MissingCustomerEmail);
        }
        if !self
            .ledger
            .has_event(&invoice.id, EmailType::Initial, None)
            .await?
        {
            return Ok(ManualOutcome::InitialEmailRequired);
        }

        let outcome = match self.attempt(&invoice, now).await {
            Ok(Attempt::Sent(decision)) => ManualOutcome::Sent { decision },
            Ok(Attempt::DryRun(decision)) => ManualOutcome::DryRun { decision },
            Ok(Attempt::Deferred(decision)) => ManualOutcome::NothingDue {
                next_at: Some(decision.scheduled_at),
                email_type: Some(decision.email_type),
            },
            Ok(Attempt::Skipped(_)) => ManualOutcome::NothingDue {
                next_at: None,
                email_type: None,
            },
            Ok(Attempt::RateLimited(_, reason)) => ManualOutcome::RateLimited { reason },
            Err(e) => match e.stage {
                FailureStage::Send => ManualOutcome::SendFailed {
                    error: e.error.to_string(),
                },
                FailureStage::Ledger | FailureStage::LedgerAfterSend => {
                    ManualOutcome::LedgerWriteFailed {
                        error: e.error.to_string(),
                    }
                }
                FailureStage::Resolve | FailureStage::Gate => return Err(e.error),
            },
        };
        tracing::info!("✋ Manual chase of {invoice_id}: {}", outcome.code());
        Ok(outcome)
    }

    /// Timeline and next step for an invoice. `None` when it does not exist
    /// or belongs to a different tenant.
    pub async fn preview(
        &self,
        invoice_id: &str,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SchedulePreview>> {
        let Some(invoice) = self.invoices.get_invoice(invoice_id).await? else {
            return Ok(None);
        };
        if tenant_id.is_some_and(|t| t != invoice.tenant_id) {
            return Ok(None);
        }
        let next = self.resolver.next_email_for(&invoice, now).await?;
        Ok(Some(SchedulePreview {
            timeline: self.resolver.upcoming_schedule(&invoice),
            invoice_id: invoice.id,
            status: invoice.status,
            due_at: invoice.due_at,
            next,
        }))
    }
}
