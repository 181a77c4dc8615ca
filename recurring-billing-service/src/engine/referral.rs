//! Referral discount ledger.
//!
//! A referrer earns one ledger entry per referred client. Entries are never deleted while
//! the referral exists; they flip inactive/active as the referred client cancels and
//! reactivates. Only the oldest `max_discount_referrals` active entries contribute.

use crate::models::{Client, ReferralEntry, ReferralGrant, ReferralProgram};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A referrer's entries together with the tenant's program rules.
#[derive(Debug, Clone)]
pub struct ReferralDiscountLedger {
    entries: Vec<ReferralEntry>,
    program: ReferralProgram,
}

impl ReferralDiscountLedger {
    /// `entries` must be the entries where the client is the referrer.
    pub fn new(mut entries: Vec<ReferralEntry>, program: ReferralProgram) -> Self {
        entries.sort_by(|a, b| {
            a.created_utc
                .cmp(&b.created_utc)
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });
        Self { entries, program }
    }

    /// A ledger with no entries; resolves to zero discount.
    pub fn empty(program: ReferralProgram) -> Self {
        Self {
            entries: Vec::new(),
            program,
        }
    }

    pub fn program(&self) -> &ReferralProgram {
        &self.program
    }

    /// Sum of `discount_amount` over the oldest active entries, capped at the program's
    /// `max_discount_referrals` (0 = unlimited). Zero when the program is inactive.
    pub fn total_active_discount(&self) -> Decimal {
        if !self.program.active {
            return Decimal::ZERO;
        }

        let limit = self.program.contributing_limit().unwrap_or(usize::MAX);

        self.entries
            .iter()
            .filter(|entry| entry.active)
            .take(limit)
            .map(|entry| entry.discount_amount)
            .sum::<Decimal>()
            .round_dp(2)
    }
}

/// Deactivate every entry naming `referred_id`. Returns the entries that changed.
pub fn on_referred_client_cancel(
    entries: &mut [ReferralEntry],
    referred_id: Uuid,
) -> Vec<ReferralEntry> {
    set_active_for_referred(entries, referred_id, false)
}

/// Reactivate every entry naming `referred_id`. Returns the entries that changed.
pub fn on_referred_client_reactivate(
    entries: &mut [ReferralEntry],
    referred_id: Uuid,
) -> Vec<ReferralEntry> {
    set_active_for_referred(entries, referred_id, true)
}

fn set_active_for_referred(
    entries: &mut [ReferralEntry],
    referred_id: Uuid,
    active: bool,
) -> Vec<ReferralEntry> {
    entries
        .iter_mut()
        .filter(|entry| entry.referred_id == referred_id && entry.active != active)
        .map(|entry| {
            entry.active = active;
            entry.clone()
        })
        .collect()
}

/// The grant earned when a referred client settles their first invoice, if any.
pub fn grant_for_first_payment(client: &Client, program: &ReferralProgram) -> Option<ReferralGrant> {
    let referrer_id = client.referred_by?;

    if !program.active || program.discount_per_referral <= Decimal::ZERO {
        return None;
    }
    if referrer_id == client.client_id {
        return None;
    }

    Some(ReferralGrant {
        referrer_id,
        referred_id: client.client_id,
        discount_amount: program.discount_per_referral.round_dp(2),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};
    use rust_decimal_macros::dec;

    fn program(max: i32, minimum: Decimal) -> ReferralProgram {
        ReferralProgram {
            tenant_id: Uuid::nil(),
            active: true,
            max_discount_referrals: max,
            minimum_invoice_price: minimum,
            discount_per_referral: dec!(2.00),
        }
    }

    fn entry(referrer: Uuid, amount: Decimal, active: bool, age_days: i64) -> ReferralEntry {
        ReferralEntry {
            entry_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            referrer_id: referrer,
            referred_id: Uuid::new_v4(),
            discount_amount: amount,
            active,
            created_utc: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn sums_active_entries() {
        let referrer = Uuid::new_v4();
        let ledger = ReferralDiscountLedger::new(
            vec![
                entry(referrer, dec!(2.00), true, 3),
                entry(referrer, dec!(2.00), true, 2),
                entry(referrer, dec!(2.00), false, 1),
            ],
            program(5, dec!(50.00)),
        );
        assert_eq!(ledger.total_active_discount(), dec!(4.00));
    }

    #[test]
    fn only_oldest_active_entries_contribute() {
        let referrer = Uuid::new_v4();
        let ledger = ReferralDiscountLedger::new(
            vec![
                entry(referrer, dec!(1.00), true, 1),
                entry(referrer, dec!(5.00), true, 10),
                entry(referrer, dec!(3.00), true, 5),
            ],
            program(2, Decimal::ZERO),
        );
        // oldest two: 5.00 (10 days) and 3.00 (5 days)
        assert_eq!(ledger.total_active_discount(), dec!(8.00));
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let referrer = Uuid::new_v4();
        let entries = (0..20)
            .map(|i| entry(referrer, dec!(1.50), true, i))
            .collect();
        let ledger = ReferralDiscountLedger::new(entries, program(0, Decimal::ZERO));
        assert_eq!(ledger.total_active_discount(), dec!(30.00));
    }

    #[test]
    fn inactive_program_grants_nothing() {
        let referrer = Uuid::new_v4();
        let mut rules = program(0, Decimal::ZERO);
        rules.active = false;
        let ledger = ReferralDiscountLedger::new(vec![entry(referrer, dec!(2.00), true, 1)], rules);
        assert_eq!(ledger.total_active_discount(), Decimal::ZERO);
    }

    #[test]
    fn cancel_and_reactivate_flip_only_matching_entries() {
        let referrer = Uuid::new_v4();
        let mut entries = vec![
            entry(referrer, dec!(2.00), true, 2),
            entry(referrer, dec!(2.00), true, 1),
        ];
        let referred = entries[0].referred_id;

        let changed = on_referred_client_cancel(&mut entries, referred);
        assert_eq!(changed.len(), 1);
        assert!(!entries[0].active);
        assert!(entries[1].active);

        // already inactive: nothing more changes
        assert!(on_referred_client_cancel(&mut entries, referred).is_empty());

        let changed = on_referred_client_reactivate(&mut entries, referred);
        assert_eq!(changed.len(), 1);
        assert!(entries[0].active);
    }

    #[test]
    fn first_payment_grant_requires_referrer_and_active_program() {
        let referrer = Uuid::new_v4();
        let mut client = Client {
            client_id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            name: "Ana".to_string(),
            plan_id: None,
            due_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            cancelled: false,
            cancelled_at: None,
            referred_by: None,
            payment_method: None,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        let rules = program(5, dec!(50.00));
        assert!(grant_for_first_payment(&client, &rules).is_none());

        client.referred_by = Some(referrer);
        let grant = grant_for_first_payment(&client, &rules).unwrap();
        assert_eq!(grant.referrer_id, referrer);
        assert_eq!(grant.referred_id, client.client_id);
        assert_eq!(grant.discount_amount, dec!(2.00));

        let mut inactive = rules.clone();
        inactive.active = false;
        assert!(grant_for_first_payment(&client, &inactive).is_none());
    }
}
