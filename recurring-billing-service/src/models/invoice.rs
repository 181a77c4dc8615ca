//! Invoice (mensalidade) model.

use crate::engine::pricing::PriceResolution;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Invoice state derived from the `paid` / `cancelled` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    Open,
    Paid,
    Cancelled,
}

impl InvoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceState::Open => "open",
            InvoiceState::Paid => "paid",
            InvoiceState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One billing period's charge for a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub paid: bool,
    pub paid_at: Option<NaiveDate>,
    pub cancelled: bool,
    pub cancelled_at: Option<NaiveDate>,
    pub base_price_snapshot: Decimal,
    pub campaign_discount_snapshot: Decimal,
    pub referral_discount_snapshot: Decimal,
    pub campaign_period_index: Option<i32>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn state(&self) -> InvoiceState {
        if self.paid {
            InvoiceState::Paid
        } else if self.cancelled {
            InvoiceState::Cancelled
        } else {
            InvoiceState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == InvoiceState::Open
    }

    /// Overwrite amount and audit snapshots with a fresh resolution.
    pub fn reprice(&mut self, resolution: &PriceResolution) {
        self.amount = resolution.amount;
        self.base_price_snapshot = resolution.base_price;
        self.campaign_discount_snapshot = resolution.campaign_discount();
        self.referral_discount_snapshot = resolution.referral_discount();
        self.campaign_period_index = resolution.campaign_period_index();
    }
}

/// An invoice the engine wants created. The caller persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub base_price_snapshot: Decimal,
    pub campaign_discount_snapshot: Decimal,
    pub referral_discount_snapshot: Decimal,
    pub campaign_period_index: Option<i32>,
}

impl NewInvoice {
    pub fn priced(
        tenant_id: Uuid,
        client_id: Uuid,
        due_date: NaiveDate,
        resolution: &PriceResolution,
    ) -> Self {
        Self {
            invoice_id: Uuid::new_v4(),
            tenant_id,
            client_id,
            amount: resolution.amount,
            due_date,
            base_price_snapshot: resolution.base_price,
            campaign_discount_snapshot: resolution.campaign_discount(),
            referral_discount_snapshot: resolution.referral_discount(),
            campaign_period_index: resolution.campaign_period_index(),
        }
    }

    /// The row this insert produces, as read back from the store.
    pub fn into_invoice(self, now: DateTime<Utc>) -> Invoice {
        Invoice {
            invoice_id: self.invoice_id,
            tenant_id: self.tenant_id,
            client_id: self.client_id,
            amount: self.amount,
            due_date: self.due_date,
            paid: false,
            paid_at: None,
            cancelled: false,
            cancelled_at: None,
            base_price_snapshot: self.base_price_snapshot,
            campaign_discount_snapshot: self.campaign_discount_snapshot,
            referral_discount_snapshot: self.referral_discount_snapshot,
            campaign_period_index: self.campaign_period_index,
            created_utc: now,
            updated_utc: now,
        }
    }
}
