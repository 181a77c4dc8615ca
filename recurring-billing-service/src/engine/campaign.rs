//! Campaign enrollment rules.

use crate::engine::calendar::days_between;
use crate::error::BillingError;
use crate::models::{CampaignEnrollment, PricingCatalog};
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

/// What the reactivation policy did to the client's enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationPolicyOutcome {
    NotEnrolled,
    Preserved,
    Forfeited,
}

/// Enroll the client in the plan's campaign if the campaign is active and the client has
/// no active enrollment on this plan. Returns whether an enrollment was created.
pub fn enroll_if_eligible(
    enrollment: &mut CampaignEnrollment,
    catalog: &PricingCatalog,
    today: NaiveDate,
) -> bool {
    let Some(campaign) = catalog.campaign.as_ref() else {
        return false;
    };
    if enrollment.is_active_on(catalog.plan_id) {
        return false;
    }

    enrollment.plan_id = Some(catalog.plan_id);
    enrollment.enrolled = true;
    enrollment.enrolled_at = Some(today);
    enrollment.periods_consumed = 0;
    enrollment.campaign_length_snapshot = Some(campaign.length as i32);
    true
}

/// End the enrollment and clear its counters.
pub fn terminate(enrollment: &mut CampaignEnrollment) {
    enrollment.plan_id = None;
    enrollment.enrolled = false;
    enrollment.enrolled_at = None;
    enrollment.periods_consumed = 0;
    enrollment.campaign_length_snapshot = None;
}

/// Count one paid campaign invoice. `invoice_period_index` is the paid invoice's
/// `campaign_period_index`; invoices priced outside the campaign do not count.
///
/// Returns the completed campaign length when this payment consumed the last period,
/// in which case the enrollment has been terminated. An enrolled row without a length
/// snapshot is corrupt and fails with `MissingPricingData`.
pub fn record_paid_period(
    enrollment: &mut CampaignEnrollment,
    plan_id: Uuid,
    invoice_period_index: Option<i32>,
) -> Result<Option<u32>, BillingError> {
    if !enrollment.enrolled || invoice_period_index.is_none() {
        return Ok(None);
    }

    let length = enrollment
        .campaign_length_snapshot
        .filter(|len| *len > 0)
        .ok_or_else(|| BillingError::MissingPricingData {
            plan_id: enrollment.plan_id.unwrap_or(plan_id),
            reason: format!(
                "client {} is enrolled without a campaign length snapshot",
                enrollment.client_id
            ),
        })?;
    enrollment.periods_consumed = (enrollment.periods_consumed + 1).min(length);

    if enrollment.periods_consumed >= length {
        terminate(enrollment);
        Ok(Some(length as u32))
    } else {
        Ok(None)
    }
}

/// Short cancellations keep an in-progress campaign; long ones forfeit it.
/// A missing cancellation date counts as a long absence.
pub fn apply_reactivation_policy(
    enrollment: &mut CampaignEnrollment,
    cancelled_at: Option<NaiveDate>,
    reactivated_on: NaiveDate,
    grace_days: i64,
) -> ReactivationPolicyOutcome {
    if !enrollment.enrolled {
        return ReactivationPolicyOutcome::NotEnrolled;
    }

    let within_grace = cancelled_at
        .is_some_and(|cancelled| days_between(cancelled, reactivated_on) <= grace_days);

    if within_grace {
        ReactivationPolicyOutcome::Preserved
    } else {
        terminate(enrollment);
        ReactivationPolicyOutcome::Forfeited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanPeriod;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn campaign_plan(length: u32) -> PricingCatalog {
        PricingCatalog::new(Uuid::new_v4(), dec!(35.00), PlanPeriod::Monthly)
            .with_fixed_campaign(length, dec!(10.00))
    }

    #[test]
    fn enrolls_on_campaign_plan_only() {
        let mut enrollment = CampaignEnrollment::none(Uuid::new_v4());
        let plain = PricingCatalog::new(Uuid::new_v4(), dec!(35.00), PlanPeriod::Monthly);
        assert!(!enroll_if_eligible(&mut enrollment, &plain, date(2024, 1, 1)));
        assert!(!enrollment.enrolled);

        let plan = campaign_plan(3);
        assert!(enroll_if_eligible(&mut enrollment, &plan, date(2024, 1, 1)));
        assert_eq!(enrollment.campaign_length_snapshot, Some(3));
        assert_eq!(enrollment.periods_consumed, 0);
        assert_eq!(enrollment.enrolled_at, Some(date(2024, 1, 1)));
    }

    #[test]
    fn active_enrollment_on_same_plan_is_not_restarted() {
        let plan = campaign_plan(3);
        let mut enrollment = CampaignEnrollment::none(Uuid::new_v4());
        enroll_if_eligible(&mut enrollment, &plan, date(2024, 1, 1));
        record_paid_period(&mut enrollment, plan.plan_id, Some(1)).unwrap();

        assert!(!enroll_if_eligible(&mut enrollment, &plan, date(2024, 2, 1)));
        assert_eq!(enrollment.periods_consumed, 1);
        assert_eq!(enrollment.enrolled_at, Some(date(2024, 1, 1)));
    }

    #[test]
    fn consuming_all_periods_completes_campaign() {
        let plan = campaign_plan(2);
        let mut enrollment = CampaignEnrollment::none(Uuid::new_v4());
        enroll_if_eligible(&mut enrollment, &plan, date(2024, 1, 1));

        assert_eq!(record_paid_period(&mut enrollment, plan.plan_id, Some(1)).unwrap(), None);
        assert_eq!(enrollment.periods_consumed, 1);
        assert_eq!(record_paid_period(&mut enrollment, plan.plan_id, Some(2)).unwrap(), Some(2));
        assert!(!enrollment.enrolled);
        assert_eq!(enrollment.periods_consumed, 0);
        assert_eq!(enrollment.campaign_length_snapshot, None);
    }

    #[test]
    fn non_campaign_invoice_does_not_consume_period() {
        let plan = campaign_plan(2);
        let mut enrollment = CampaignEnrollment::none(Uuid::new_v4());
        enroll_if_eligible(&mut enrollment, &plan, date(2024, 1, 1));

        assert_eq!(record_paid_period(&mut enrollment, plan.plan_id, None).unwrap(), None);
        assert_eq!(enrollment.periods_consumed, 0);
    }

    #[test]
    fn consumed_never_exceeds_snapshot() {
        let mut enrollment = CampaignEnrollment {
            client_id: Uuid::new_v4(),
            plan_id: Some(Uuid::new_v4()),
            enrolled: true,
            enrolled_at: Some(date(2024, 1, 1)),
            periods_consumed: 5,
            campaign_length_snapshot: Some(3),
        };
        let plan_id = enrollment.plan_id.unwrap();
        assert_eq!(record_paid_period(&mut enrollment, plan_id, Some(6)).unwrap(), Some(3));
        assert!(!enrollment.enrolled);
    }

    #[test]
    fn enrolled_row_without_snapshot_is_rejected() {
        let plan_id = Uuid::new_v4();
        let mut enrollment = CampaignEnrollment {
            client_id: Uuid::new_v4(),
            plan_id: Some(plan_id),
            enrolled: true,
            enrolled_at: Some(date(2024, 1, 1)),
            periods_consumed: 1,
            campaign_length_snapshot: None,
        };

        let err = record_paid_period(&mut enrollment, plan_id, Some(2)).unwrap_err();
        assert!(matches!(err, BillingError::MissingPricingData { .. }));
        assert!(enrollment.enrolled);
        assert_eq!(enrollment.periods_consumed, 1);
    }

    #[test]
    fn short_cancellation_preserves_enrollment() {
        let plan = campaign_plan(3);
        let mut enrollment = CampaignEnrollment::none(Uuid::new_v4());
        enroll_if_eligible(&mut enrollment, &plan, date(2023, 12, 1));
        record_paid_period(&mut enrollment, plan.plan_id, Some(1)).unwrap();

        let outcome =
            apply_reactivation_policy(&mut enrollment, Some(date(2024, 1, 1)), date(2024, 1, 5), 7);
        assert_eq!(outcome, ReactivationPolicyOutcome::Preserved);
        assert!(enrollment.enrolled);
        assert_eq!(enrollment.periods_consumed, 1);

        // exactly at the grace boundary still preserves
        let outcome =
            apply_reactivation_policy(&mut enrollment, Some(date(2024, 1, 1)), date(2024, 1, 8), 7);
        assert_eq!(outcome, ReactivationPolicyOutcome::Preserved);
    }

    #[test]
    fn long_cancellation_forfeits_enrollment() {
        let plan = campaign_plan(3);
        let mut enrollment = CampaignEnrollment::none(Uuid::new_v4());
        enroll_if_eligible(&mut enrollment, &plan, date(2023, 12, 1));

        let outcome =
            apply_reactivation_policy(&mut enrollment, Some(date(2024, 1, 1)), date(2024, 2, 1), 7);
        assert_eq!(outcome, ReactivationPolicyOutcome::Forfeited);
        assert!(!enrollment.enrolled);
        assert_eq!(enrollment.campaign_length_snapshot, None);
    }

    #[test]
    fn policy_ignores_clients_without_enrollment() {
        let mut enrollment = CampaignEnrollment::none(Uuid::new_v4());
        let outcome =
            apply_reactivation_policy(&mut enrollment, Some(date(2024, 1, 1)), date(2024, 6, 1), 7);
        assert_eq!(outcome, ReactivationPolicyOutcome::NotEnrolled);
    }
}
