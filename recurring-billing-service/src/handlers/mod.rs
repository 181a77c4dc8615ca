//! HTTP handlers for recurring-billing-service.

pub mod billing;

pub use billing::{
    cancel_client, change_plan, create_first_invoice, pay_invoice, price_preview,
    reactivate_client, reprocess_invoices,
};
