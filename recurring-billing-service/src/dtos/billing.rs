use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Largest batch accepted by `/v1/invoices/reprocess`.
pub const MAX_REPROCESS_BATCH: usize = 500;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Optional effective date for transitions that otherwise have no body.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct EffectiveDateRequest {
    pub on: Option<NaiveDate>,
}

impl EffectiveDateRequest {
    pub fn effective_on(&self) -> NaiveDate {
        self.on.unwrap_or_else(today)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct PayInvoiceRequest {
    /// Defaults to today.
    pub paid_at: Option<NaiveDate>,
}

impl PayInvoiceRequest {
    pub fn paid_on(&self) -> NaiveDate {
        self.paid_at.unwrap_or_else(today)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ReactivateRequest {
    #[validate(length(
        min = 1,
        max = 64,
        message = "Payment method must be between 1 and 64 characters"
    ))]
    pub payment_method: Option<String>,
    /// Plan to re-adopt; a plan with an active campaign re-enrolls the client.
    pub plan_id: Option<Uuid>,
    pub on: Option<NaiveDate>,
}

impl ReactivateRequest {
    pub fn effective_on(&self) -> NaiveDate {
        self.on.unwrap_or_else(today)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChangePlanRequest {
    pub plan_id: Uuid,
    pub on: Option<NaiveDate>,
}

impl ChangePlanRequest {
    pub fn effective_on(&self) -> NaiveDate {
        self.on.unwrap_or_else(today)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ReprocessRequest {
    #[validate(length(
        min = 1,
        max = 500,
        message = "Between 1 and 500 invoice ids are required"
    ))]
    pub invoice_ids: Vec<Uuid>,
    pub paid_at: Option<NaiveDate>,
}

impl ReprocessRequest {
    pub fn paid_on(&self) -> NaiveDate {
        self.paid_at.unwrap_or_else(today)
    }
}
