//! Error type for the billing engine and its store.

use chrono::NaiveDate;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Postgres SQLSTATE raised by `FOR UPDATE NOWAIT` when the row is already locked.
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Debug, Error)]
pub enum BillingError {
    /// The entity is already in a state the requested transition cannot start from.
    /// Recovered by the service layer as an idempotent no-op.
    #[error("{entity} {id} cannot transition: already {state}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        state: String,
    },

    #[error("missing pricing data for plan {plan_id}: {reason}")]
    MissingPricingData { plan_id: Uuid, reason: String },

    #[error("invoice {0} is already being processed")]
    ConcurrentModification(Uuid),

    #[error("invalid plan change: {0}")]
    InvalidPlanChange(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("cannot advance {from} by {months} months")]
    DateOutOfRange { from: NaiveDate, months: u32 },

    #[error("database error: {0}")]
    Database(anyhow::Error),
}

impl BillingError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::MissingPricingData { .. } => "missing_pricing_data",
            BillingError::ConcurrentModification(_) => "concurrent_modification",
            BillingError::InvalidPlanChange(_) => "invalid_plan_change",
            BillingError::NotFound { .. } => "not_found",
            BillingError::DateOutOfRange { .. } => "date_out_of_range",
            BillingError::Database(_) => "database",
        }
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        BillingError::NotFound { entity, id }
    }

    /// Wrap a sqlx error with the failing operation for context.
    pub fn database(context: &str, err: sqlx::Error) -> Self {
        BillingError::Database(anyhow::anyhow!("{}: {}", context, err))
    }

    /// Map a row-lock failure to `ConcurrentModification`, anything else to `Database`.
    pub fn from_lock_attempt(invoice_id: Uuid, err: sqlx::Error) -> Self {
        if is_lock_not_available(&err) {
            BillingError::ConcurrentModification(invoice_id)
        } else {
            BillingError::database("Failed to lock invoice", err)
        }
    }
}

/// True when Postgres refused a `NOWAIT` lock because another transaction holds it.
pub fn is_lock_not_available(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE)
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidTransition { .. } | BillingError::ConcurrentModification(_) => {
                AppError::Conflict(anyhow::Error::new(err))
            }
            BillingError::MissingPricingData { .. } => {
                AppError::UnprocessableEntity(anyhow::Error::new(err))
            }
            BillingError::InvalidPlanChange(_) | BillingError::DateOutOfRange { .. } => {
                AppError::BadRequest(anyhow::Error::new(err))
            }
            BillingError::NotFound { .. } => AppError::NotFound(anyhow::Error::new(err)),
            BillingError::Database(e) => AppError::DatabaseError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn missing_pricing_data_is_unprocessable() {
        let err = BillingError::MissingPricingData {
            plan_id: Uuid::nil(),
            reason: "fixed campaign without price".to_string(),
        };
        let app: AppError = err.into();
        assert_eq!(app.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn concurrent_modification_is_conflict() {
        let app: AppError = BillingError::ConcurrentModification(Uuid::nil()).into();
        assert_eq!(app.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_keeps_entity_in_message() {
        let err = BillingError::not_found("client", Uuid::nil());
        assert!(err.to_string().starts_with("client "));
        let app: AppError = err.into();
        assert_eq!(app.status_code(), StatusCode::NOT_FOUND);
    }
}
