//! Schedule resolver: decides which chase email, if any, an invoice is owed next.
//!
//! Rules are evaluated in strict precedence and the first unsent rule whose
//! window currently applies wins:
//!
//! ```text
//!   reminder     now < due             morning(due - 3d), or now + 10m when < 3d remain
//!   due          until day 63 past due morning(due), or now once that slot has passed
//!   late weekly  days 7..=62 past due  morning(due + 7w) for w = days / 7
//! ```
//!
//! Future-dated decisions are still returned; the dispatcher decides when to act.

use std::sync::Arc;

use chaser_core::{BusinessClock, EmailType, EventLedger, Invoice, Result, ScheduleDecision};
use chrono::{DateTime, Duration, Utc};

pub use chaser_core::plan::{
    CHASE_HORIZON_DAYS, LATE_WEEK_DAYS, MAX_LATE_WEEK, REMINDER_LEAD_DAYS,
    SHORT_FUSE_DELAY_MINUTES,
};

/// Late-weekly week number for a number of whole days past due.
pub fn late_week_for(days_past_due: i64) -> Option<u32> {
    if (LATE_WEEK_DAYS..CHASE_HORIZON_DAYS).contains(&days_past_due) {
        Some((days_past_due / LATE_WEEK_DAYS) as u32)
    } else {
        None
    }
}

/// Ledger-aware schedule resolver.
#[derive(Clone)]
pub struct ScheduleResolver {
    clock: BusinessClock,
    ledger: Arc<dyn EventLedger>,
}

impl ScheduleResolver {
    pub fn new(clock: BusinessClock, ledger: Arc<dyn EventLedger>) -> Self {
        Self { clock, ledger }
    }

    pub fn clock(&self) -> &BusinessClock {
        &self.clock
    }

    /// The next email owed for `invoice` as of `now`, or `None`.
    pub async fn next_email_for(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleDecision>> {
        if !invoice.is_chaseable() {
            return Ok(None);
        }
        let Some(due_at) = invoice.due_at else {
            tracing::debug!("Invoice {} has no due date, nothing to schedule", invoice.id);
            return Ok(None);
        };
        let due_date = BusinessClock::due_date(due_at);
        let morning = |days: i64| {
            let at = self.clock.morning_after(due_date, days);
            if at.is_none() {
                tracing::warn!(
                    "⚠️ Invoice {}: due date {due_at} is outside the schedulable range",
                    invoice.id
                );
            }
            at
        };

        if now < due_at
            && !self
                .ledger
                .has_event(&invoice.id, EmailType::Reminder, None)
                .await?
        {
            let at = if due_at - now >= Duration::days(REMINDER_LEAD_DAYS) {
                let Some(at) = morning(-REMINDER_LEAD_DAYS) else {
                    return Ok(None);
                };
                at
            } else {
                now + Duration::minutes(SHORT_FUSE_DELAY_MINUTES)
            };
            return Ok(Some(ScheduleDecision::new(EmailType::Reminder, at)));
        }

        // Whole elapsed days; week boundaries land on exact multiples of 7 days.
        let days_past_due = (now - due_at).num_days();
        if days_past_due >= CHASE_HORIZON_DAYS {
            return Ok(None);
        }

        if !self
            .ledger
            .has_event(&invoice.id, EmailType::Due, None)
            .await?
        {
            let Some(slot) = morning(0) else {
                return Ok(None);
            };
            let at = if slot < now { now } else { slot };
            return Ok(Some(ScheduleDecision::new(EmailType::Due, at)));
        }

        if now >= due_at
            && let Some(week) = late_week_for(days_past_due)
            && !self
                .ledger
                .has_event(&invoice.id, EmailType::LateWeekly, Some(week))
                .await?
        {
            let Some(at) = morning(LATE_WEEK_DAYS * week as i64) else {
                return Ok(None);
            };
            return Ok(Some(ScheduleDecision::late_weekly(week, at)));
        }

        Ok(None)
    }

    /// Every email the invoice could ever be sent, ignoring the ledger and
    /// the current time. Used for previews and debugging only. Entries that
    /// fall outside chrono's date range are left out.
    pub fn upcoming_schedule(&self, invoice: &Invoice) -> Vec<ScheduleDecision> {
        let Some(due_at) = invoice.due_at else {
            return Vec::new();
        };
        let due_date = BusinessClock::due_date(due_at);
        let reminder = self
            .clock
            .morning_after(due_date, -REMINDER_LEAD_DAYS)
            .map(|at| ScheduleDecision::new(EmailType::Reminder, at));
        let due = self
            .clock
            .morning_after(due_date, 0)
            .map(|at| ScheduleDecision::new(EmailType::Due, at));
        let weekly = (1..=MAX_LATE_WEEK).filter_map(|week| {
            self.clock
                .morning_after(due_date, LATE_WEEK_DAYS * week as i64)
                .map(|at| ScheduleDecision::late_weekly(week, at))
        });
        reminder.into_iter().chain(due).chain(weekly).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chaser_core::{EmailEvent, InvoiceStatus};
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn invoice(due_at: DateTime<Utc>) -> Invoice {
        Invoice {
            id: "inv-1".into(),
            tenant_id: "t-1".into(),
            customer_email: "ap@customer.test".into(),
            customer_name: None,
            invoice_number: None,
            amount_cents: 10_000,
            currency: "USD".into(),
            due_at: Some(due_at),
            status: InvoiceStatus::Pending,
            payment_link: None,
        }
    }

    fn setup() -> (Arc<MemoryStore>, ScheduleResolver) {
        let store = Arc::new(MemoryStore::new());
        let resolver = ScheduleResolver::new(BusinessClock::default(), store.clone());
        (store, resolver)
    }

    fn real_event(inv: &Invoice, t: EmailType, week: Option<u32>) -> EmailEvent {
        EmailEvent {
            id: format!("ev-{t}-{week:?}"),
            invoice_id: inv.id.clone(),
            tenant_id: inv.tenant_id.clone(),
            email_type: t,
            week_number: week,
            created_at: at(2026, 1, 1, 0, 0),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_reminder_scenario_morning_slot() {
        let (_store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        let d = resolver
            .next_email_for(&inv, at(2026, 2, 1, 0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.email_type, EmailType::Reminder);
        assert_eq!(d.scheduled_at, at(2026, 2, 7, 15, 0));
        assert_eq!(d.week_number, None);
    }

    #[tokio::test]
    async fn test_exactly_three_days_uses_morning_slot() {
        let (_store, resolver) = setup();
        let now = at(2026, 3, 2, 12, 0);
        let inv = invoice(now + Duration::days(3));
        let d = resolver.next_email_for(&inv, now).await.unwrap().unwrap();
        assert_eq!(d.email_type, EmailType::Reminder);
        assert_eq!(d.scheduled_at, at(2026, 3, 2, 15, 0));
    }

    #[tokio::test]
    async fn test_two_days_uses_short_fuse() {
        let (_store, resolver) = setup();
        let now = at(2026, 3, 2, 12, 0);
        let inv = invoice(now + Duration::days(2));
        let d = resolver.next_email_for(&inv, now).await.unwrap().unwrap();
        assert_eq!(d.email_type, EmailType::Reminder);
        assert_eq!(d.scheduled_at, now + Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_late_week_one_scenario() {
        let (store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        store.record(real_event(&inv, EmailType::Due, None));
        let d = resolver
            .next_email_for(&inv, at(2026, 2, 20, 0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.email_type, EmailType::LateWeekly);
        assert_eq!(d.week_number, Some(1));
        assert_eq!(d.scheduled_at, at(2026, 2, 17, 15, 0));
    }

    #[tokio::test]
    async fn test_missed_due_catches_up_now() {
        let (_store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        let now = at(2026, 2, 12, 8, 30);
        let d = resolver.next_email_for(&inv, now).await.unwrap().unwrap();
        assert_eq!(d.email_type, EmailType::Due);
        assert_eq!(d.scheduled_at, now);
    }

    #[tokio::test]
    async fn test_due_is_future_morning_before_slot() {
        let (store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        store.record(real_event(&inv, EmailType::Reminder, None));
        let d = resolver
            .next_email_for(&inv, at(2026, 2, 9, 0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.email_type, EmailType::Due);
        assert_eq!(d.scheduled_at, at(2026, 2, 10, 15, 0));
    }

    #[tokio::test]
    async fn test_late_weekly_independent_of_due_key() {
        let (store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        store.record(real_event(&inv, EmailType::LateWeekly, Some(1)));
        // Due never recorded: due still wins by precedence.
        let d = resolver
            .next_email_for(&inv, at(2026, 2, 20, 0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.email_type, EmailType::Due);

        store.record(real_event(&inv, EmailType::Due, None));
        // Week 1 already sent, week 2 window not open yet.
        assert!(
            resolver
                .next_email_for(&inv, at(2026, 2, 20, 0, 0))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_non_pending_or_missing_address_yields_none() {
        let (_store, resolver) = setup();
        let now = at(2026, 2, 1, 0, 0);
        let mut inv = invoice(at(2026, 2, 10, 0, 0));
        inv.status = InvoiceStatus::Paid;
        assert!(resolver.next_email_for(&inv, now).await.unwrap().is_none());
        inv.status = InvoiceStatus::Overdue;
        assert!(resolver.next_email_for(&inv, now).await.unwrap().is_none());
        inv.status = InvoiceStatus::Pending;
        inv.customer_email.clear();
        assert!(resolver.next_email_for(&inv, now).await.unwrap().is_none());
        inv.customer_email = "x@y.test".into();
        inv.due_at = None;
        assert!(resolver.next_email_for(&inv, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nothing_owed_after_horizon() {
        let (store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        let now = inv.due_at.unwrap() + Duration::days(CHASE_HORIZON_DAYS);
        assert!(resolver.next_email_for(&inv, now).await.unwrap().is_none());
        store.record(real_event(&inv, EmailType::Due, None));
        let last_day = inv.due_at.unwrap() + Duration::days(CHASE_HORIZON_DAYS - 1);
        let d = resolver.next_email_for(&inv, last_day).await.unwrap().unwrap();
        assert_eq!(d.week_number, Some(8));
    }

    #[tokio::test]
    async fn test_idempotent_for_every_recorded_key() {
        let (store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        let mut now = at(2026, 1, 15, 0, 0);
        let end = inv.due_at.unwrap() + Duration::days(70);
        let mut seen = std::collections::HashSet::new();
        while now < end {
            if let Some(d) = resolver.next_email_for(&inv, now).await.unwrap() {
                let key = (d.email_type, d.week_number);
                if d.is_due(now, Duration::minutes(10)) {
                    assert!(seen.insert(key), "{key:?} returned after being recorded");
                    store.record(real_event(&inv, d.email_type, d.week_number));
                } else {
                    assert!(!seen.contains(&key));
                }
            }
            now += Duration::hours(6);
        }
    }

    #[tokio::test]
    async fn test_daily_lifecycle_sends_each_email_once_in_order() {
        let (store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        let mut now = at(2026, 1, 20, 0, 0);
        let end = inv.due_at.unwrap() + Duration::days(CHASE_HORIZON_DAYS + 7);
        let mut sent = Vec::new();
        while now <= end {
            if let Some(d) = resolver.next_email_for(&inv, now).await.unwrap()
                && d.is_due(now, Duration::minutes(SHORT_FUSE_DELAY_MINUTES))
            {
                sent.push((d.email_type, d.week_number));
                store.record(real_event(&inv, d.email_type, d.week_number));
            }
            now += Duration::days(1);
        }

        let mut expected = vec![(EmailType::Reminder, None), (EmailType::Due, None)];
        expected.extend((1..=8).map(|w| (EmailType::LateWeekly, Some(w))));
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_upcoming_schedule_is_full_timeline() {
        let (_store, resolver) = setup();
        let inv = invoice(at(2026, 2, 10, 0, 0));
        let timeline = resolver.upcoming_schedule(&inv);
        assert_eq!(timeline.len(), 10);
        assert_eq!(timeline[0].scheduled_at, at(2026, 2, 7, 15, 0));
        assert_eq!(timeline[1].scheduled_at, at(2026, 2, 10, 15, 0));
        assert_eq!(timeline[9].week_number, Some(8));
        assert_eq!(timeline[9].scheduled_at, at(2026, 4, 7, 15, 0));
    }

    #[tokio::test]
    async fn test_due_date_at_end_of_time_does_not_panic() {
        let (_store, resolver) = setup();
        let edge = chrono::NaiveDate::MAX
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let inv = invoice(edge);

        let timeline = resolver.upcoming_schedule(&inv);
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].email_type, EmailType::Reminder);
        assert_eq!(timeline[1].email_type, EmailType::Due);

        let d = resolver
            .next_email_for(&inv, at(2026, 2, 1, 0, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.email_type, EmailType::Reminder);
    }

    #[test]
    fn test_late_week_windows() {
        assert_eq!(late_week_for(6), None);
        assert_eq!(late_week_for(7), Some(1));
        assert_eq!(late_week_for(13), Some(1));
        assert_eq!(late_week_for(14), Some(2));
        assert_eq!(late_week_for(62), Some(8));
        assert_eq!(late_week_for(63), None);
    }
}
