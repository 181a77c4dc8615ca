//! Client model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A reseller's subscriber. `due_date` anchors the current/next invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Client {
    pub client_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub plan_id: Option<Uuid>,
    pub due_date: NaiveDate,
    pub cancelled: bool,
    pub cancelled_at: Option<NaiveDate>,
    pub referred_by: Option<Uuid>,
    pub payment_method: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a client.
#[derive(Debug, Clone)]
pub struct CreateClient {
    pub tenant_id: Uuid,
    pub name: String,
    pub plan_id: Option<Uuid>,
    pub due_date: NaiveDate,
    pub referred_by: Option<Uuid>,
    pub payment_method: Option<String>,
}
