//! Referral discount ledger and program models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One discount grant per (referrer, referred) pair.
/// `active` mirrors whether the referred client is currently not cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ReferralEntry {
    pub entry_id: Uuid,
    pub tenant_id: Uuid,
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub discount_amount: Decimal,
    pub active: bool,
    pub created_utc: DateTime<Utc>,
}

/// Per-tenant referral rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ReferralProgram {
    pub tenant_id: Uuid,
    pub active: bool,
    /// 0 = unlimited.
    pub max_discount_referrals: i32,
    pub minimum_invoice_price: Decimal,
    pub discount_per_referral: Decimal,
}

impl ReferralProgram {
    /// Number of oldest active entries that may contribute, `None` when unlimited.
    pub fn contributing_limit(&self) -> Option<usize> {
        match self.max_discount_referrals {
            n if n <= 0 => None,
            n => Some(n as usize),
        }
    }
}

/// A discount to be written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralGrant {
    pub referrer_id: Uuid,
    pub referred_id: Uuid,
    pub discount_amount: Decimal,
}
