//! Due-date arithmetic.

use crate::error::BillingError;
use crate::models::PlanPeriod;
use chrono::{Datelike, Duration, Months, NaiveDate};

/// Advance `from` by `months`. When the day-of-month does not exist in the target month
/// (e.g. the 31st in a 30-day month) the result rolls to day 1 of the following month.
pub fn add_months_rolling(from: NaiveDate, months: u32) -> Result<NaiveDate, BillingError> {
    let out_of_range = || BillingError::DateOutOfRange { from, months };

    // chrono clamps to the last day of the target month; detect that and roll over.
    let clamped = from
        .checked_add_months(Months::new(months))
        .ok_or_else(out_of_range)?;

    if clamped.day() == from.day() {
        Ok(clamped)
    } else {
        clamped.succ_opt().ok_or_else(out_of_range)
    }
}

/// Next due date one plan period after `baseline`.
pub fn advance_due_date(baseline: NaiveDate, period: PlanPeriod) -> Result<NaiveDate, BillingError> {
    add_months_rolling(baseline, period.months())
}

pub fn first_day_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

/// Whole days from `earlier` to `later` (negative when `later` precedes `earlier`).
pub fn days_between(earlier: NaiveDate, later: NaiveDate) -> i64 {
    (later - earlier).num_days()
}
