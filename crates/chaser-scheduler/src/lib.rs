//! # Chaser Scheduler
//!
//! Decides which invoice-chasing email each pending invoice is owed, enforces
//! plan rate limits, and drives sends through the mailer with an append-only
//! ledger for idempotency.
//!
//! ## Architecture
//! ```text
//! trigger (cron endpoint / chase loop / CLI)
//!   └── Dispatcher::run_batch
//!         ├── InvoiceSource:    keyset page of pending invoices
//!         ├── ScheduleResolver: reminder → due → late weekly 1..8
//!         ├── PlanLimiter:      cooldown, daily cap, per-type cap, week ceiling
//!         ├── Mailer:           delivery (webhook / log)
//!         └── EventLedger:      one real event per (invoice, type, week)
//! ```

pub mod dispatch;
pub mod engine;
pub mod limits;
pub mod locks;
pub mod memory;
pub mod persistence;
pub mod resolver;

pub use dispatch::{
    BatchReport, Collaborators, DispatchSettings, Dispatcher, FailureStage, InvoiceOutcome,
    ManualOutcome, Outcome, SchedulePreview, SkipReason,
};
pub use engine::spawn_chase_loop;
pub use limits::{DenyReason, Gate, PlanLimiter};
pub use memory::{MemoryMailer, MemoryStore};
pub use persistence::ChaserDb;
pub use resolver::ScheduleResolver;
