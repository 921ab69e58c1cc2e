//! # Chaser Core
//!
//! Shared foundation for the invoice chase scheduler: domain types, the error
//! type, configuration, the fixed-offset business clock, timestamp
//! normalization and the collaborator traits the scheduler is written against.

pub mod clock;
pub mod config;
pub mod error;
pub mod plan;
pub mod timestamp;
pub mod traits;
pub mod types;

pub use clock::BusinessClock;
pub use config::ChaserConfig;
pub use error::{ChaseError, Result};
pub use plan::{PlanLimitTable, PlanLimits, TypeCaps};
pub use traits::{CandidateQuery, EventLedger, InvoiceCursor, InvoiceSource, Mailer, PlanDirectory};
pub use types::{
    EmailEvent, EmailType, Invoice, InvoiceStatus, Plan, ScheduleDecision, SendRequest,
    TenantSendHistory,
};
