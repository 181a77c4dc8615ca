//! Pure billing rules. Nothing in here touches the database or the network.

pub mod calendar;
pub mod campaign;
pub mod events;
pub mod lifecycle;
pub mod pricing;
pub mod referral;

pub use events::BillingEvent;
pub use lifecycle::{
    cancel_client, change_plan, mark_paid, open_first_invoice, reactivate_client, spawn_next,
    CancellationTransition, ClientBilling, FirstInvoiceTransition, LifecyclePolicy,
    PaymentTransition, PlanChangeTransition, ReactivationRequest, ReactivationTransition,
    Settlement, SuccessorSkip,
};
pub use pricing::{resolve, PriceResolution, PricingMode};
pub use referral::ReferralDiscountLedger;
