//! Services module for recurring-billing-service.

pub mod billing;
pub mod database;
pub mod metrics;
pub mod notifier;
pub mod store;

pub use billing::{
    BillingService, CancelOutcome, FirstInvoiceOutcome, MarkPaidOutcome, PlanChangeOutcome,
    PricePreview, ReactivateOutcome, ReprocessSummary,
};
pub use database::Database;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use notifier::{EventNotifier, LogNotifier, WebhookNotifier};
