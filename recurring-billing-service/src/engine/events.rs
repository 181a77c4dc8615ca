//! Domain events emitted by billing transitions.
//!
//! Events are returned alongside each transition and dispatched by the caller only after
//! the transition has been committed.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillingEvent {
    InvoicePaid {
        tenant_id: Uuid,
        client_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        paid_at: NaiveDate,
    },
    /// Consumers send the welcome message.
    FirstInvoicePaid {
        tenant_id: Uuid,
        client_id: Uuid,
        invoice_id: Uuid,
    },
    InvoiceCreated {
        tenant_id: Uuid,
        client_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
        due_date: NaiveDate,
    },
    CampaignCompleted {
        tenant_id: Uuid,
        client_id: Uuid,
        plan_id: Option<Uuid>,
        periods: u32,
    },
    ReferralDiscountGranted {
        tenant_id: Uuid,
        referrer_id: Uuid,
        referred_id: Uuid,
        discount_amount: Decimal,
    },
}

impl BillingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BillingEvent::InvoicePaid { .. } => "invoice_paid",
            BillingEvent::FirstInvoicePaid { .. } => "first_invoice_paid",
            BillingEvent::InvoiceCreated { .. } => "invoice_created",
            BillingEvent::CampaignCompleted { .. } => "campaign_completed",
            BillingEvent::ReferralDiscountGranted { .. } => "referral_discount_granted",
        }
    }

    pub fn client_id(&self) -> Uuid {
        match self {
            BillingEvent::InvoicePaid { client_id, .. }
            | BillingEvent::FirstInvoicePaid { client_id, .. }
            | BillingEvent::InvoiceCreated { client_id, .. }
            | BillingEvent::CampaignCompleted { client_id, .. } => *client_id,
            BillingEvent::ReferralDiscountGranted { referrer_id, .. } => *referrer_id,
        }
    }
}
