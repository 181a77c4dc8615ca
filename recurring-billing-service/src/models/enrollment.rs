//! Campaign enrollment model.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A client's participation in a plan's campaign. One row per client.
///
/// `campaign_length_snapshot` is copied from the plan at enrollment time so that later
/// edits to the plan do not change an in-flight schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CampaignEnrollment {
    pub client_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub enrolled: bool,
    pub enrolled_at: Option<NaiveDate>,
    pub periods_consumed: i32,
    pub campaign_length_snapshot: Option<i32>,
}

impl CampaignEnrollment {
    /// The "never enrolled" record for a client with no stored row.
    pub fn none(client_id: Uuid) -> Self {
        Self {
            client_id,
            plan_id: None,
            enrolled: false,
            enrolled_at: None,
            periods_consumed: 0,
            campaign_length_snapshot: None,
        }
    }

    pub fn is_active_on(&self, plan_id: Uuid) -> bool {
        self.enrolled && self.plan_id == Some(plan_id)
    }
}
