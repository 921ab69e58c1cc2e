//! Plan limit tables.

use serde::{Deserialize, Serialize};

use crate::error::{ChaseError, Result};
use crate::types::{EmailType, Plan};

/// Highest late-weekly week number the resolver ever produces.
pub const MAX_LATE_WEEK: u32 = 8;
/// Reminders target the business morning this many days before due.
pub const REMINDER_LEAD_DAYS: i64 = 3;
/// Short-fuse reminders go out this long after evaluation.
pub const SHORT_FUSE_DELAY_MINUTES: i64 = 10;
pub const LATE_WEEK_DAYS: i64 = 7;
/// First whole day past due on which nothing is owed any more.
pub const CHASE_HORIZON_DAYS: i64 = LATE_WEEK_DAYS * (MAX_LATE_WEEK as i64 + 1);

/// Per-invoice cap for each email type. Indexed by `EmailType`, so a new
/// email type does not compile until it has a cap here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCaps {
    pub initial: u32,
    pub reminder: u32,
    pub due: u32,
    pub late_weekly: u32,
}

impl TypeCaps {
    pub fn get(&self, email_type: EmailType) -> u32 {
        match email_type {
            EmailType::Initial => self.initial,
            EmailType::Reminder => self.reminder,
            EmailType::Due => self.due,
            EmailType::LateWeekly => self.late_weekly,
        }
    }
}

/// Rate-limit policy for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub daily_email_cap: u32,
    pub cooldown_minutes: u32,
    pub per_type_cap: TypeCaps,
    /// Highest reachable late-weekly week number, if the plan restricts it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_week_ceiling: Option<u32>,
}

impl PlanLimits {
    pub fn trial() -> Self {
        Self {
            daily_email_cap: 10,
            cooldown_minutes: 10,
            per_type_cap: TypeCaps {
                initial: 1,
                reminder: 1,
                due: 1,
                late_weekly: 3,
            },
            late_week_ceiling: Some(3),
        }
    }

    pub fn starter() -> Self {
        Self {
            daily_email_cap: 100,
            cooldown_minutes: 5,
            per_type_cap: TypeCaps {
                initial: 1,
                reminder: 1,
                due: 1,
                late_weekly: 4,
            },
            late_week_ceiling: None,
        }
    }

    pub fn pro() -> Self {
        Self {
            daily_email_cap: 500,
            cooldown_minutes: 2,
            per_type_cap: TypeCaps {
                initial: 1,
                reminder: 1,
                due: 1,
                late_weekly: MAX_LATE_WEEK,
            },
            late_week_ceiling: None,
        }
    }

    pub fn business() -> Self {
        Self {
            daily_email_cap: 2000,
            cooldown_minutes: 1,
            per_type_cap: TypeCaps {
                initial: 1,
                reminder: 1,
                due: 1,
                late_weekly: MAX_LATE_WEEK,
            },
            late_week_ceiling: None,
        }
    }

    fn validate(&self, plan: Plan) -> Result<()> {
        if self.daily_email_cap == 0 {
            return Err(ChaseError::config(format!(
                "limits.{plan}.daily_email_cap must be > 0"
            )));
        }
        for t in EmailType::ALL {
            if self.per_type_cap.get(t) == 0 {
                return Err(ChaseError::config(format!(
                    "limits.{plan}.per_type_cap.{t} must be > 0"
                )));
            }
        }
        if let Some(ceiling) = self.late_week_ceiling
            && !(1..=MAX_LATE_WEEK).contains(&ceiling)
        {
            return Err(ChaseError::config(format!(
                "limits.{plan}.late_week_ceiling must be 1..={MAX_LATE_WEEK}, got {ceiling}"
            )));
        }
        Ok(())
    }
}

/// Limits for every plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimitTable {
    #[serde(default = "PlanLimits::trial")]
    pub trial: PlanLimits,
    #[serde(default = "PlanLimits::starter")]
    pub starter: PlanLimits,
    #[serde(default = "PlanLimits::pro")]
    pub pro: PlanLimits,
    #[serde(default = "PlanLimits::business")]
    pub business: PlanLimits,
}

impl Default for PlanLimitTable {
    fn default() -> Self {
        Self {
            trial: PlanLimits::trial(),
            starter: PlanLimits::starter(),
            pro: PlanLimits::pro(),
            business: PlanLimits::business(),
        }
    }
}

impl PlanLimitTable {
    pub fn get(&self, plan: Plan) -> &PlanLimits {
        match plan {
            Plan::Trial => &self.trial,
            Plan::Starter => &self.starter,
            Plan::Pro => &self.pro,
            Plan::Business => &self.business,
        }
    }

    /// Reject tables the limiter cannot safely enforce.
    pub fn validate(&self) -> Result<()> {
        for plan in Plan::ALL {
            self.get(plan).validate(plan)?;
        }
        Ok(())
    }
}
