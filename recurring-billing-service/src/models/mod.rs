//! Domain models for recurring-billing-service.

mod client;
mod enrollment;
mod invoice;
mod plan;
mod referral;

pub use client::{Client, CreateClient};
pub use enrollment::CampaignEnrollment;
pub use invoice::{Invoice, InvoiceState, NewInvoice};
pub use plan::{
    BillingPlan, Campaign, CampaignKind, CampaignPriceRow, CampaignPricing, CreatePlan,
    PlanPeriod, PricingCatalog, MAX_CAMPAIGN_PERIODS,
};
pub use referral::{ReferralEntry, ReferralGrant, ReferralProgram};
