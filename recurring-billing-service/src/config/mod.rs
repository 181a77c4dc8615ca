//! Configuration module for recurring-billing-service.

use crate::engine::LifecyclePolicy;
use crate::models::ReferralProgram;
use rust_decimal::Decimal;
use service_core::config::{self as core_config, env_or};
use service_core::error::AppError;
use std::env;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub referral_defaults: ReferralDefaults,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub late_payment_grace_days: i64,
    pub reactivation_grace_days: i64,
}

impl EngineConfig {
    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            late_payment_grace_days: self.late_payment_grace_days,
            reactivation_grace_days: self.reactivation_grace_days,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let policy = LifecyclePolicy::default();
        Self {
            late_payment_grace_days: policy.late_payment_grace_days,
            reactivation_grace_days: policy.reactivation_grace_days,
        }
    }
}

/// Referral rules for tenants without a `referral_programs` row.
#[derive(Debug, Clone, Copy)]
pub struct ReferralDefaults {
    pub max_discount_referrals: i32,
    pub minimum_invoice_price: Decimal,
    pub discount_per_referral: Decimal,
}

impl ReferralDefaults {
    pub fn program_for(&self, tenant_id: Uuid) -> ReferralProgram {
        ReferralProgram {
            tenant_id,
            active: self.discount_per_referral > Decimal::ZERO,
            max_discount_referrals: self.max_discount_referrals,
            minimum_invoice_price: self.minimum_invoice_price,
            discount_per_referral: self.discount_per_referral,
        }
    }
}

impl Default for ReferralDefaults {
    fn default() -> Self {
        Self {
            max_discount_referrals: 0,
            minimum_invoice_price: Decimal::ZERO,
            discount_per_referral: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    /// Events are only logged when unset.
    pub webhook_url: Option<String>,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let late_payment_grace_days: i64 = env_or("LATE_PAYMENT_GRACE_DAYS", 7);
        let reactivation_grace_days: i64 = env_or("REACTIVATION_GRACE_DAYS", 7);
        if late_payment_grace_days < 0 || reactivation_grace_days < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "grace periods must not be negative"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "recurring-billing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            engine: EngineConfig {
                late_payment_grace_days,
                reactivation_grace_days,
            },
            referral_defaults: ReferralDefaults {
                max_discount_referrals: env_or::<i32>("DEFAULT_MAX_DISCOUNT_REFERRALS", 0).max(0),
                minimum_invoice_price: env_or("DEFAULT_MINIMUM_INVOICE_PRICE", Decimal::ZERO)
                    .round_dp(2),
                discount_per_referral: env_or("DEFAULT_DISCOUNT_PER_REFERRAL", Decimal::ZERO)
                    .round_dp(2),
            },
            notifications: NotificationConfig {
                webhook_url: env::var("NOTIFICATION_WEBHOOK_URL")
                    .ok()
                    .filter(|url| !url.trim().is_empty()),
            },
        })
    }
}
