//! Database service for recurring-billing-service.
//!
//! Pool-level reads and the writes used to set up plans, clients and referral programs.
//! Queries that run inside a billing transition live in [`crate::services::store`].

use crate::error::BillingError;
use crate::models::{
    BillingPlan, CampaignEnrollment, Client, CreateClient, CreatePlan, Invoice, ReferralEntry,
    ReferralProgram,
};
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "recurring-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Start a transaction for one billing transition.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, BillingError> {
        self.pool
            .begin()
            .await
            .map_err(|e| BillingError::database("Failed to begin transaction", e))
    }

    // =========================================================================
    // Setup writes
    // =========================================================================

    /// Create a plan together with its staged campaign prices.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    pub async fn create_plan(&self, input: &CreatePlan) -> Result<BillingPlan, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        let mut tx = self.begin().await?;

        let plan = sqlx::query_as::<_, BillingPlan>(
            r#"
            INSERT INTO billing_plans (plan_id, tenant_id, name, base_price, period, campaign_active, campaign_kind, campaign_length, campaign_fixed_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING plan_id, tenant_id, name, base_price, period, campaign_active, campaign_kind, campaign_length, campaign_fixed_price, is_active, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(input.base_price.round_dp(2))
        .bind(input.period.as_str())
        .bind(input.campaign_active)
        .bind(input.campaign_kind.map(|kind| kind.as_str()))
        .bind(input.campaign_length)
        .bind(input.campaign_fixed_price)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::database("Failed to create plan", e))?;

        for (period_number, price) in &input.campaign_staged_prices {
            sqlx::query(
                "INSERT INTO plan_campaign_prices (plan_id, period_number, price) VALUES ($1, $2, $3)",
            )
            .bind(plan.plan_id)
            .bind(period_number)
            .bind(price.round_dp(2))
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::database("Failed to store campaign price", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit transaction", e))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");

        Ok(plan)
    }

    /// Create a client. The client has no invoice until the first one is opened.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    pub async fn create_client(&self, input: &CreateClient) -> Result<Client, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_client"])
            .start_timer();

        let client = sqlx::query_as::<_, Client>(
            r#"
            INSERT INTO clients (client_id, tenant_id, name, plan_id, due_date, referred_by, payment_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING client_id, tenant_id, name, plan_id, due_date, cancelled, cancelled_at, referred_by, payment_method, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(input.plan_id)
        .bind(input.due_date)
        .bind(input.referred_by)
        .bind(&input.payment_method)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to create client", e))?;

        timer.observe_duration();
        info!(client_id = %client.client_id, "Client created");

        Ok(client)
    }

    /// Insert or replace a tenant's referral rules.
    #[instrument(skip(self, program), fields(tenant_id = %program.tenant_id))]
    pub async fn upsert_referral_program(
        &self,
        program: &ReferralProgram,
    ) -> Result<ReferralProgram, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_referral_program"])
            .start_timer();

        let stored = sqlx::query_as::<_, ReferralProgram>(
            r#"
            INSERT INTO referral_programs (tenant_id, active, max_discount_referrals, minimum_invoice_price, discount_per_referral)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id) DO UPDATE
            SET active = EXCLUDED.active,
                max_discount_referrals = EXCLUDED.max_discount_referrals,
                minimum_invoice_price = EXCLUDED.minimum_invoice_price,
                discount_per_referral = EXCLUDED.discount_per_referral,
                updated_utc = NOW()
            RETURNING tenant_id, active, max_discount_referrals, minimum_invoice_price, discount_per_referral
            "#,
        )
        .bind(program.tenant_id)
        .bind(program.active)
        .bind(program.max_discount_referrals.max(0))
        .bind(program.minimum_invoice_price.round_dp(2))
        .bind(program.discount_per_referral.round_dp(2))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to store referral program", e))?;

        timer.observe_duration();

        Ok(stored)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read an invoice without locking it.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, amount, due_date, paid, paid_at, cancelled, cancelled_at,
                   base_price_snapshot, campaign_discount_snapshot, referral_discount_snapshot, campaign_period_index,
                   created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to get invoice", e))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// All invoices of a client, oldest due date first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id))]
    pub async fn list_client_invoices(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
    ) -> Result<Vec<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_client_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, amount, due_date, paid, paid_at, cancelled, cancelled_at,
                   base_price_snapshot, campaign_discount_snapshot, referral_discount_snapshot, campaign_period_index,
                   created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND client_id = $2
            ORDER BY due_date, created_utc
            "#,
        )
        .bind(tenant_id)
        .bind(client_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to list invoices", e))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id))]
    pub async fn get_client(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
    ) -> Result<Option<Client>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_client"])
            .start_timer();

        let client = sqlx::query_as::<_, Client>(
            r#"
            SELECT client_id, tenant_id, name, plan_id, due_date, cancelled, cancelled_at, referred_by, payment_method, created_utc, updated_utc
            FROM clients
            WHERE tenant_id = $1 AND client_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to get client", e))?;

        timer.observe_duration();

        Ok(client)
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn get_enrollment(
        &self,
        client_id: Uuid,
    ) -> Result<Option<CampaignEnrollment>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_enrollment"])
            .start_timer();

        let enrollment = sqlx::query_as::<_, CampaignEnrollment>(
            r#"
            SELECT client_id, plan_id, enrolled, enrolled_at, periods_consumed, campaign_length_snapshot
            FROM campaign_enrollments
            WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to get enrollment", e))?;

        timer.observe_duration();

        Ok(enrollment)
    }

    /// Ledger entries where `referrer_id` is the referrer.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, referrer_id = %referrer_id))]
    pub async fn list_referrer_entries(
        &self,
        tenant_id: Uuid,
        referrer_id: Uuid,
    ) -> Result<Vec<ReferralEntry>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_referrer_entries"])
            .start_timer();

        let entries = sqlx::query_as::<_, ReferralEntry>(
            r#"
            SELECT entry_id, tenant_id, referrer_id, referred_id, discount_amount, active, created_utc
            FROM referral_discounts
            WHERE tenant_id = $1 AND referrer_id = $2
            ORDER BY created_utc, entry_id
            "#,
        )
        .bind(tenant_id)
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::database("Failed to list referral entries", e))?;

        timer.observe_duration();

        Ok(entries)
    }
}
