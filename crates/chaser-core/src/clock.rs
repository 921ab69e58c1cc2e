//! Business clock: maps calendar dates to "9:00 in the business timezone".
//!
//! The reference timezone is a FIXED UTC offset. It does not follow daylight
//! saving transitions, so instants near a DST boundary can be one hour off the
//! wall clock. Callers accept that drift; the offset is configuration.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};

use crate::error::{ChaseError, Result};

/// Chicago standard time, UTC-06:00.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = -6 * 60;
pub const DEFAULT_MORNING_HOUR: u32 = 9;

/// Fixed-offset business clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessClock {
    offset: FixedOffset,
    morning_hour: u32,
}

impl BusinessClock {
    pub fn new(utc_offset_minutes: i32, morning_hour: u32) -> Result<Self> {
        if morning_hour > 23 {
            return Err(ChaseError::config(format!(
                "clock.morning_hour must be 0..=23, got {morning_hour}"
            )));
        }
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
            ChaseError::config(format!(
                "clock.utc_offset_minutes out of range: {utc_offset_minutes}"
            ))
        })?;
        Ok(Self {
            offset,
            morning_hour,
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// `morning_hour:00` local time on `date`, as an absolute instant.
    pub fn business_morning(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_hms_opt(self.morning_hour, 0, 0).unwrap_or_default();
        (local - Duration::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }

    /// Business morning `days` after `date`; `None` past chrono's date range.
    pub fn morning_after(&self, date: NaiveDate, days: i64) -> Option<DateTime<Utc>> {
        let local = date
            .checked_add_signed(Duration::days(days))?
            .and_hms_opt(self.morning_hour, 0, 0)?;
        local
            .checked_sub_signed(Duration::seconds(self.offset.local_minus_utc() as i64))
            .map(|t| t.and_utc())
    }

    /// Start of the business-timezone calendar day containing `now`.
    pub fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = now.with_timezone(&self.offset).date_naive();
        let midnight = local_date.and_hms_opt(0, 0, 0).unwrap_or_default();
        (midnight - Duration::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }

    /// Calendar date a due instant is anchored to (its UTC date).
    pub fn due_date(due_at: DateTime<Utc>) -> NaiveDate {
        due_at.date_naive()
    }
}

impl Default for BusinessClock {
    fn default() -> Self {
        Self {
            offset: FixedOffset::east_opt(DEFAULT_UTC_OFFSET_MINUTES * 60)
                .unwrap_or_else(|| Utc.fix()),
            morning_hour: DEFAULT_MORNING_HOUR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_chicago_morning_is_15_utc() {
        let clock = BusinessClock::default();
        let date = NaiveDate::from_ymd_opt(2026, 2, 7).unwrap();
        assert_eq!(
            clock.business_morning(date),
            Utc.with_ymd_and_hms(2026, 2, 7, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_fixed_offset_ignores_dst() {
        // July in Chicago is CDT (UTC-5) but the policy stays at UTC-6.
        let clock = BusinessClock::default();
        let date = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        assert_eq!(
            clock.business_morning(date),
            Utc.with_ymd_and_hms(2026, 7, 1, 15, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_day_start_uses_business_day() {
        let clock = BusinessClock::default();
        // 03:00 UTC is still the previous evening in Chicago.
        let now = Utc.with_ymd_and_hms(2026, 2, 8, 3, 0, 0).unwrap();
        assert_eq!(
            clock.day_start(now),
            Utc.with_ymd_and_hms(2026, 2, 7, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_morning_after_is_checked() {
        let clock = BusinessClock::default();
        let date = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        assert_eq!(
            clock.morning_after(date, -3),
            Some(Utc.with_ymd_and_hms(2026, 2, 7, 15, 0, 0).unwrap())
        );
        assert!(clock.morning_after(NaiveDate::MAX, 0).is_some());
        assert_eq!(clock.morning_after(NaiveDate::MAX, 7), None);
        assert_eq!(clock.morning_after(NaiveDate::MIN, -3), None);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(BusinessClock::new(-360, 24).is_err());
        assert!(BusinessClock::new(24 * 60, 9).is_err());
        assert!(BusinessClock::new(60, 8).is_ok());
    }
}
