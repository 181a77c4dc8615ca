//! Plan (pricing catalog) model.

use crate::error::BillingError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Longest campaign schedule a plan may carry, in periods.
pub const MAX_CAMPAIGN_PERIODS: u32 = 12;

/// Plan periodicity. The value is the number of months a paid invoice advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPeriod {
    Monthly,
    Bimonthly,
    Quarterly,
    Semiannual,
    Annual,
}

impl PlanPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanPeriod::Monthly => "monthly",
            PlanPeriod::Bimonthly => "bimonthly",
            PlanPeriod::Quarterly => "quarterly",
            PlanPeriod::Semiannual => "semiannual",
            PlanPeriod::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(PlanPeriod::Monthly),
            "bimonthly" => Some(PlanPeriod::Bimonthly),
            "quarterly" => Some(PlanPeriod::Quarterly),
            "semiannual" => Some(PlanPeriod::Semiannual),
            "annual" => Some(PlanPeriod::Annual),
            _ => None,
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            PlanPeriod::Monthly => 1,
            PlanPeriod::Bimonthly => 2,
            PlanPeriod::Quarterly => 3,
            PlanPeriod::Semiannual => 6,
            PlanPeriod::Annual => 12,
        }
    }
}

/// How a campaign prices its periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignKind {
    Fixed,
    Staged,
}

impl CampaignKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Fixed => "fixed",
            CampaignKind::Staged => "staged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(CampaignKind::Fixed),
            "staged" => Some(CampaignKind::Staged),
            _ => None,
        }
    }
}

/// Billing plan row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingPlan {
    pub plan_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub base_price: Decimal,
    pub period: String,
    pub campaign_active: bool,
    pub campaign_kind: Option<String>,
    pub campaign_length: Option<i32>,
    pub campaign_fixed_price: Option<Decimal>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// One slot of a staged campaign schedule.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CampaignPriceRow {
    pub plan_id: Uuid,
    pub period_number: i32,
    pub price: Decimal,
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub tenant_id: Uuid,
    pub name: String,
    pub base_price: Decimal,
    pub period: PlanPeriod,
    pub campaign_active: bool,
    pub campaign_kind: Option<CampaignKind>,
    pub campaign_length: Option<i32>,
    pub campaign_fixed_price: Option<Decimal>,
    /// `(period_number, price)` pairs, period numbers 1..=12.
    pub campaign_staged_prices: Vec<(i32, Decimal)>,
}

/// Promotional price schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignPricing {
    Fixed(Decimal),
    /// Sparse; keyed by period number within the campaign (1..=12).
    Staged(BTreeMap<u32, Decimal>),
}

/// An active campaign attached to a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Campaign {
    pub length: u32,
    pub pricing: CampaignPricing,
}

impl Campaign {
    /// Price of the `period_index`-th campaign invoice. Staged slots beyond 12 reuse slot 12;
    /// unset slots fall back to `base_price`.
    pub fn price_for(&self, period_index: u32, base_price: Decimal) -> Decimal {
        match &self.pricing {
            CampaignPricing::Fixed(price) => *price,
            CampaignPricing::Staged(prices) => prices
                .get(&period_index.min(MAX_CAMPAIGN_PERIODS))
                .copied()
                .unwrap_or(base_price),
        }
    }
}

/// Validated, immutable pricing view of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingCatalog {
    pub plan_id: Uuid,
    pub base_price: Decimal,
    pub period: PlanPeriod,
    /// `Some` iff the plan's campaign is active.
    pub campaign: Option<Campaign>,
}

impl PricingCatalog {
    pub fn new(plan_id: Uuid, base_price: Decimal, period: PlanPeriod) -> Self {
        Self {
            plan_id,
            base_price: base_price.round_dp(2),
            period,
            campaign: None,
        }
    }

    pub fn with_fixed_campaign(mut self, length: u32, price: Decimal) -> Self {
        self.campaign = Some(Campaign {
            length,
            pricing: CampaignPricing::Fixed(price.round_dp(2)),
        });
        self
    }

    pub fn with_staged_campaign(mut self, length: u32, prices: &[(u32, Decimal)]) -> Self {
        let schedule = prices
            .iter()
            .map(|(period, price)| (*period, price.round_dp(2)))
            .collect();
        self.campaign = Some(Campaign {
            length,
            pricing: CampaignPricing::Staged(schedule),
        });
        self
    }

    /// Build from stored rows, rejecting an active campaign whose price fields are absent.
    pub fn from_plan(
        plan: &BillingPlan,
        staged_prices: &[CampaignPriceRow],
    ) -> Result<Self, BillingError> {
        let missing = |reason: &str| BillingError::MissingPricingData {
            plan_id: plan.plan_id,
            reason: reason.to_string(),
        };

        let period = PlanPeriod::parse(&plan.period)
            .ok_or_else(|| missing(&format!("unknown period '{}'", plan.period)))?;
        let catalog = PricingCatalog::new(plan.plan_id, plan.base_price, period);

        if !plan.campaign_active {
            return Ok(catalog);
        }

        let length = plan
            .campaign_length
            .filter(|len| (1..=MAX_CAMPAIGN_PERIODS as i32).contains(len))
            .ok_or_else(|| missing("campaign_length must be between 1 and 12"))?
            as u32;

        let kind = plan
            .campaign_kind
            .as_deref()
            .and_then(CampaignKind::parse)
            .ok_or_else(|| missing("campaign_kind is not set"))?;

        match kind {
            CampaignKind::Fixed => {
                let price = plan
                    .campaign_fixed_price
                    .ok_or_else(|| missing("fixed campaign without campaign_fixed_price"))?;
                Ok(catalog.with_fixed_campaign(length, price))
            }
            CampaignKind::Staged => {
                let prices: Vec<(u32, Decimal)> = staged_prices
                    .iter()
                    .filter(|row| row.plan_id == plan.plan_id)
                    .filter(|row| (1..=MAX_CAMPAIGN_PERIODS as i32).contains(&row.period_number))
                    .map(|row| (row.period_number as u32, row.price))
                    .collect();
                if prices.is_empty() {
                    return Err(missing("staged campaign without any staged price"));
                }
                Ok(catalog.with_staged_campaign(length, &prices))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn plan_row() -> BillingPlan {
        BillingPlan {
            plan_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Mensal".to_string(),
            base_price: dec!(35.00),
            period: "monthly".to_string(),
            campaign_active: false,
            campaign_kind: None,
            campaign_length: None,
            campaign_fixed_price: None,
            is_active: true,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn period_months() {
        assert_eq!(PlanPeriod::Monthly.months(), 1);
        assert_eq!(PlanPeriod::Bimonthly.months(), 2);
        assert_eq!(PlanPeriod::Quarterly.months(), 3);
        assert_eq!(PlanPeriod::Semiannual.months(), 6);
        assert_eq!(PlanPeriod::Annual.months(), 12);
        assert_eq!(PlanPeriod::parse("weekly"), None);
    }

    #[test]
    fn inactive_campaign_ignores_campaign_fields() {
        let mut plan = plan_row();
        plan.campaign_kind = Some("fixed".to_string());
        let catalog = PricingCatalog::from_plan(&plan, &[]).unwrap();
        assert!(catalog.campaign.is_none());
        assert_eq!(catalog.base_price, dec!(35.00));
    }

    #[test]
    fn active_fixed_campaign_requires_price() {
        let mut plan = plan_row();
        plan.campaign_active = true;
        plan.campaign_kind = Some("fixed".to_string());
        plan.campaign_length = Some(3);

        let err = PricingCatalog::from_plan(&plan, &[]).unwrap_err();
        assert!(matches!(err, BillingError::MissingPricingData { .. }));

        plan.campaign_fixed_price = Some(dec!(10.00));
        let catalog = PricingCatalog::from_plan(&plan, &[]).unwrap();
        assert_eq!(
            catalog.campaign,
            Some(Campaign {
                length: 3,
                pricing: CampaignPricing::Fixed(dec!(10.00))
            })
        );
    }

    #[test]
    fn active_campaign_requires_length_in_range() {
        let mut plan = plan_row();
        plan.campaign_active = true;
        plan.campaign_kind = Some("fixed".to_string());
        plan.campaign_fixed_price = Some(dec!(10.00));
        plan.campaign_length = Some(13);
        assert!(PricingCatalog::from_plan(&plan, &[]).is_err());
        plan.campaign_length = None;
        assert!(PricingCatalog::from_plan(&plan, &[]).is_err());
    }

    #[test]
    fn staged_campaign_reads_sparse_slots() {
        let mut plan = plan_row();
        plan.campaign_active = true;
        plan.campaign_kind = Some("staged".to_string());
        plan.campaign_length = Some(4);
        let rows = vec![
            CampaignPriceRow {
                plan_id: plan.plan_id,
                period_number: 1,
                price: dec!(5.00),
            },
            CampaignPriceRow {
                plan_id: plan.plan_id,
                period_number: 3,
                price: dec!(20.00),
            },
        ];

        let catalog = PricingCatalog::from_plan(&plan, &rows).unwrap();
        let campaign = catalog.campaign.unwrap();
        assert_eq!(campaign.price_for(1, dec!(35.00)), dec!(5.00));
        assert_eq!(campaign.price_for(2, dec!(35.00)), dec!(35.00));
        assert_eq!(campaign.price_for(3, dec!(35.00)), dec!(20.00));
    }

    #[test]
    fn staged_campaign_without_prices_is_rejected() {
        let mut plan = plan_row();
        plan.campaign_active = true;
        plan.campaign_kind = Some("staged".to_string());
        plan.campaign_length = Some(2);
        let err = PricingCatalog::from_plan(&plan, &[]).unwrap_err();
        assert!(err.to_string().contains("staged"));
    }

    #[test]
    fn staged_index_beyond_twelve_uses_last_slot() {
        let campaign = Campaign {
            length: 12,
            pricing: CampaignPricing::Staged(BTreeMap::from([(12, dec!(30.00))])),
        };
        assert_eq!(campaign.price_for(14, dec!(35.00)), dec!(30.00));
    }
}
