//! Plan-based rate limiting for chase sends.

use chaser_core::{
    ChaserConfig, EmailType, Plan, PlanLimitTable, PlanLimits, Result, TenantSendHistory,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Why the limiter refused a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DenyReason {
    Cooldown { retry_after_secs: i64 },
    DailyCap { cap: u32 },
    TypeCap { email_type: EmailType, cap: u32 },
    WeekCeiling { week: u32, ceiling: u32 },
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Cooldown { .. } => "cooldown",
            DenyReason::DailyCap { .. } => "daily_cap",
            DenyReason::TypeCap { .. } => "type_cap",
            DenyReason::WeekCeiling { .. } => "week_ceiling",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Cooldown { retry_after_secs } => {
                write!(f, "tenant cooldown active, retry in {retry_after_secs}s")
            }
            DenyReason::DailyCap { cap } => write!(f, "daily cap of {cap} emails reached"),
            DenyReason::TypeCap { email_type, cap } => {
                write!(f, "{email_type} cap of {cap} reached for this invoice")
            }
            DenyReason::WeekCeiling { week, ceiling } => {
                write!(f, "late week {week} is past the plan ceiling of {ceiling}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Allow,
    Deny(DenyReason),
}

impl Gate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Gate::Allow)
    }
}

/// Everything the limiter looks at for one candidate send.
#[derive(Debug, Clone, Copy)]
pub struct SendCheck<'a> {
    pub plan: Plan,
    pub history: &'a TenantSendHistory,
    /// Real events of `email_type` already recorded for the invoice.
    pub sent_for_type: u32,
    pub email_type: EmailType,
    pub week_number: Option<u32>,
    pub now: DateTime<Utc>,
}

/// Applies the plan limit table. Validated at construction.
#[derive(Debug, Clone)]
pub struct PlanLimiter {
    table: PlanLimitTable,
    bypass_cooldown: bool,
}

impl PlanLimiter {
    pub fn new(table: PlanLimitTable, bypass_cooldown: bool) -> Result<Self> {
        table.validate()?;
        Ok(Self {
            table,
            bypass_cooldown,
        })
    }

    pub fn from_config(config: &ChaserConfig) -> Result<Self> {
        let bypass = config.cooldown_bypass_active();
        if bypass {
            tracing::warn!("⚠️ Cooldown bypass active (non-production environment)");
        }
        Self::new(config.limits.plans.clone(), bypass)
    }

    pub fn limits_for(&self, plan: Plan) -> &PlanLimits {
        self.table.get(plan)
    }

    /// Gates in order: cooldown, daily cap, per-type cap, week ceiling.
    pub fn can_send(&self, check: &SendCheck<'_>) -> Gate {
        let limits = self.limits_for(check.plan);

        if !self.bypass_cooldown
            && limits.cooldown_minutes > 0
            && let Some(last) = check.history.last_sent_at
        {
            let ready_at = last + Duration::minutes(limits.cooldown_minutes as i64);
            if check.now < ready_at {
                return Gate::Deny(DenyReason::Cooldown {
                    retry_after_secs: (ready_at - check.now).num_seconds().max(1),
                });
            }
        }

        if check.history.sent_today >= limits.daily_email_cap {
            return Gate::Deny(DenyReason::DailyCap {
                cap: limits.daily_email_cap,
            });
        }

        let type_cap = limits.per_type_cap.get(check.email_type);
        if check.sent_for_type >= type_cap {
            return Gate::Deny(DenyReason::TypeCap {
                email_type: check.email_type,
                cap: type_cap,
            });
        }

        if check.email_type == EmailType::LateWeekly
            && let (Some(ceiling), Some(week)) = (limits.late_week_ceiling, check.week_number)
            && week > ceiling
        {
            return Gate::Deny(DenyReason::WeekCeiling { week, ceiling });
        }

        Gate::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 16, 0, 0).unwrap()
    }

    fn limiter() -> PlanLimiter {
        PlanLimiter::new(PlanLimitTable::default(), false).unwrap()
    }

    fn check(
        plan: Plan,
        history: &TenantSendHistory,
        t: EmailType,
        week: Option<u32>,
        sent: u32,
    ) -> SendCheck<'_> {
        SendCheck {
            plan,
            history,
            sent_for_type: sent,
            email_type: t,
            week_number: week,
            now: now(),
        }
    }

    #[test]
    fn test_trial_week_ceiling() {
        let history = TenantSendHistory::default();
        let l = limiter();
        assert_eq!(
            l.can_send(&check(Plan::Trial, &history, EmailType::LateWeekly, Some(4), 3)),
            // Type cap (3) trips before the ceiling is even consulted.
            Gate::Deny(DenyReason::TypeCap {
                email_type: EmailType::LateWeekly,
                cap: 3
            })
        );
        assert_eq!(
            l.can_send(&check(Plan::Trial, &history, EmailType::LateWeekly, Some(4), 2)),
            Gate::Deny(DenyReason::WeekCeiling { week: 4, ceiling: 3 })
        );
        assert!(
            l.can_send(&check(Plan::Trial, &history, EmailType::LateWeekly, Some(3), 2))
                .is_allowed()
        );
        assert!(
            l.can_send(&check(Plan::Pro, &history, EmailType::LateWeekly, Some(8), 7))
                .is_allowed()
        );
    }

    #[test]
    fn test_cooldown_then_allow() {
        let l = limiter();
        let history = TenantSendHistory {
            last_sent_at: Some(now() - Duration::minutes(4)),
            sent_today: 1,
        };
        match l.can_send(&check(Plan::Starter, &history, EmailType::Due, None, 0)) {
            Gate::Deny(DenyReason::Cooldown { retry_after_secs }) => {
                assert_eq!(retry_after_secs, 60)
            }
            other => panic!("expected cooldown, got {other:?}"),
        }

        let history = TenantSendHistory {
            last_sent_at: Some(now() - Duration::minutes(5)),
            sent_today: 1,
        };
        assert!(
            l.can_send(&check(Plan::Starter, &history, EmailType::Due, None, 0))
                .is_allowed()
        );
    }

    #[test]
    fn test_cooldown_bypass() {
        let l = PlanLimiter::new(PlanLimitTable::default(), true).unwrap();
        let history = TenantSendHistory {
            last_sent_at: Some(now()),
            sent_today: 0,
        };
        assert!(
            l.can_send(&check(Plan::Trial, &history, EmailType::Reminder, None, 0))
                .is_allowed()
        );
    }

    #[test]
    fn test_daily_cap() {
        let l = limiter();
        let history = TenantSendHistory {
            last_sent_at: None,
            sent_today: 10,
        };
        assert_eq!(
            l.can_send(&check(Plan::Trial, &history, EmailType::Due, None, 0)),
            Gate::Deny(DenyReason::DailyCap { cap: 10 })
        );
        assert!(
            l.can_send(&check(Plan::Starter, &history, EmailType::Due, None, 0))
                .is_allowed()
        );
    }

    #[test]
    fn test_per_type_cap_blocks_second_reminder() {
        let l = limiter();
        let history = TenantSendHistory::default();
        let gate = l.can_send(&check(Plan::Business, &history, EmailType::Reminder, None, 1));
        assert_eq!(gate.clone(), Gate::Deny(DenyReason::TypeCap {
            email_type: EmailType::Reminder,
            cap: 1
        }));
        if let Gate::Deny(reason) = gate {
            assert_eq!(reason.code(), "type_cap");
        }
    }

    #[test]
    fn test_invalid_table_rejected() {
        let mut table = PlanLimitTable::default();
        table.starter.per_type_cap.due = 0;
        assert!(PlanLimiter::new(table, false).is_err());
    }
}
