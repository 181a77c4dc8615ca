//! Price resolution for a client's next invoice.
//!
//! Resolution happens once and yields a [`PricingMode`]; both the invoice amount and the
//! invoice's audit snapshots are derived from that single value. Campaign pricing and
//! referral discounts never combine on the same invoice.

use crate::engine::referral::ReferralDiscountLedger;
use crate::error::BillingError;
use crate::models::{CampaignEnrollment, PricingCatalog};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PricingMode {
    /// Priced from the campaign schedule; `period_index` is 1-based.
    Campaign { period_index: u32 },
    /// Base price minus the referrer's capped discount, floored at the program minimum.
    ReferralDiscounted { total: Decimal },
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceResolution {
    pub mode: PricingMode,
    pub base_price: Decimal,
    pub amount: Decimal,
}

impl PriceResolution {
    pub fn campaign_discount(&self) -> Decimal {
        match self.mode {
            PricingMode::Campaign { .. } => (self.base_price - self.amount).max(Decimal::ZERO),
            _ => Decimal::ZERO,
        }
    }

    /// Discount actually applied, after the minimum-price floor.
    pub fn referral_discount(&self) -> Decimal {
        match self.mode {
            PricingMode::ReferralDiscounted { .. } => {
                (self.base_price - self.amount).max(Decimal::ZERO)
            }
            _ => Decimal::ZERO,
        }
    }

    pub fn campaign_period_index(&self) -> Option<i32> {
        match self.mode {
            PricingMode::Campaign { period_index } => Some(period_index as i32),
            _ => None,
        }
    }
}

/// Campaign period the next invoice falls into, if the client is mid-campaign on this plan.
pub fn campaign_period(
    catalog: &PricingCatalog,
    enrollment: &CampaignEnrollment,
) -> Result<Option<u32>, BillingError> {
    if !enrollment.enrolled || catalog.campaign.is_none() {
        return Ok(None);
    }
    if enrollment.plan_id.is_some_and(|plan_id| plan_id != catalog.plan_id) {
        return Ok(None);
    }

    let length = enrollment
        .campaign_length_snapshot
        .filter(|len| *len > 0)
        .ok_or_else(|| BillingError::MissingPricingData {
            plan_id: catalog.plan_id,
            reason: format!(
                "client {} is enrolled without a campaign length snapshot",
                enrollment.client_id
            ),
        })?;

    let period_index = enrollment.periods_consumed.max(0) + 1;
    if period_index <= length {
        Ok(Some(period_index as u32))
    } else {
        Ok(None)
    }
}

/// Price owed for the client's next invoice, evaluated now.
pub fn resolve(
    catalog: &PricingCatalog,
    enrollment: &CampaignEnrollment,
    ledger: &ReferralDiscountLedger,
) -> Result<PriceResolution, BillingError> {
    let base_price = catalog.base_price;

    if let (Some(period_index), Some(campaign)) =
        (campaign_period(catalog, enrollment)?, catalog.campaign.as_ref())
    {
        return Ok(PriceResolution {
            mode: PricingMode::Campaign { period_index },
            base_price,
            amount: campaign.price_for(period_index, base_price).round_dp(2),
        });
    }

    let floor = ledger.program().minimum_invoice_price;
    let total = ledger.total_active_discount();
    if total <= Decimal::ZERO {
        return Ok(PriceResolution {
            mode: PricingMode::Standard,
            base_price,
            amount: base_price.max(floor).round_dp(2),
        });
    }

    let amount = (base_price - total).max(floor).round_dp(2);

    Ok(PriceResolution {
        mode: PricingMode::ReferralDiscounted { total },
        base_price,
        amount,
    })
}
