//! Queries that run inside a billing transaction.
//!
//! Every function takes the transaction's connection. Invoice rows are locked with
//! `NOWAIT` so contention surfaces as [`BillingError::ConcurrentModification`] instead of
//! blocking; the client row is locked with a plain `FOR UPDATE`.

use crate::error::BillingError;
use crate::models::{
    BillingPlan, CampaignEnrollment, CampaignPriceRow, Client, Invoice, NewInvoice, PricingCatalog,
    ReferralEntry, ReferralGrant, ReferralProgram,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::NaiveDate;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

#[instrument(skip(conn), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
pub async fn lock_invoice(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    invoice_id: Uuid,
) -> Result<Invoice, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_invoice"])
        .start_timer();

    let invoice = sqlx::query_as::<_, Invoice>(
        r#"
        SELECT invoice_id, tenant_id, client_id, amount, due_date, paid, paid_at, cancelled, cancelled_at,
               base_price_snapshot, campaign_discount_snapshot, referral_discount_snapshot, campaign_period_index,
               created_utc, updated_utc
        FROM invoices
        WHERE tenant_id = $1 AND invoice_id = $2
        FOR UPDATE NOWAIT
        "#,
    )
    .bind(tenant_id)
    .bind(invoice_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::from_lock_attempt(invoice_id, e))?
    .ok_or_else(|| BillingError::not_found("invoice", invoice_id))?;

    timer.observe_duration();

    Ok(invoice)
}

#[instrument(skip(conn), fields(tenant_id = %tenant_id, client_id = %client_id))]
pub async fn lock_client(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    client_id: Uuid,
) -> Result<Client, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_client"])
        .start_timer();

    let client = sqlx::query_as::<_, Client>(
        r#"
        SELECT client_id, tenant_id, name, plan_id, due_date, cancelled, cancelled_at, referred_by, payment_method, created_utc, updated_utc
        FROM clients
        WHERE tenant_id = $1 AND client_id = $2
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(client_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to lock client", e))?
    .ok_or_else(|| BillingError::not_found("client", client_id))?;

    timer.observe_duration();

    Ok(client)
}

/// Lock every open invoice of the client, oldest due date first.
#[instrument(skip(conn), fields(tenant_id = %tenant_id, client_id = %client_id))]
pub async fn lock_open_invoices(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    client_id: Uuid,
) -> Result<Vec<Invoice>, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_open_invoices"])
        .start_timer();

    let invoices = sqlx::query_as::<_, Invoice>(
        r#"
        SELECT invoice_id, tenant_id, client_id, amount, due_date, paid, paid_at, cancelled, cancelled_at,
               base_price_snapshot, campaign_discount_snapshot, referral_discount_snapshot, campaign_period_index,
               created_utc, updated_utc
        FROM invoices
        WHERE tenant_id = $1 AND client_id = $2 AND NOT paid AND NOT cancelled
        ORDER BY due_date
        FOR UPDATE NOWAIT
        "#,
    )
    .bind(tenant_id)
    .bind(client_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| BillingError::from_lock_attempt(client_id, e))?;

    timer.observe_duration();

    Ok(invoices)
}

/// The most recent unpaid invoice cancelled together with the client on `cancelled_at`.
#[instrument(skip(conn), fields(client_id = %client_id))]
pub async fn find_reopenable_invoice(
    conn: &mut PgConnection,
    client_id: Uuid,
    cancelled_at: NaiveDate,
) -> Result<Option<Invoice>, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["find_reopenable_invoice"])
        .start_timer();

    let invoice = sqlx::query_as::<_, Invoice>(
        r#"
        SELECT invoice_id, tenant_id, client_id, amount, due_date, paid, paid_at, cancelled, cancelled_at,
               base_price_snapshot, campaign_discount_snapshot, referral_discount_snapshot, campaign_period_index,
               created_utc, updated_utc
        FROM invoices
        WHERE client_id = $1 AND cancelled AND NOT paid AND cancelled_at = $2
        ORDER BY due_date DESC
        LIMIT 1
        FOR UPDATE NOWAIT
        "#,
    )
    .bind(client_id)
    .bind(cancelled_at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::from_lock_attempt(client_id, e))?;

    timer.observe_duration();

    Ok(invoice)
}

#[instrument(skip(conn), fields(client_id = %client_id))]
pub async fn count_paid_invoices(
    conn: &mut PgConnection,
    client_id: Uuid,
) -> Result<i64, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["count_paid_invoices"])
        .start_timer();

    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM invoices WHERE client_id = $1 AND paid",
    )
    .bind(client_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to count paid invoices", e))?;

    timer.observe_duration();

    Ok(count)
}

/// Load and validate a plan's pricing. Unknown plans are `NotFound`.
#[instrument(skip(conn), fields(tenant_id = %tenant_id, plan_id = %plan_id))]
pub async fn load_catalog(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    plan_id: Uuid,
) -> Result<PricingCatalog, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["load_catalog"])
        .start_timer();

    let plan = sqlx::query_as::<_, BillingPlan>(
        r#"
        SELECT plan_id, tenant_id, name, base_price, period, campaign_active, campaign_kind, campaign_length, campaign_fixed_price, is_active, created_utc, updated_utc
        FROM billing_plans
        WHERE tenant_id = $1 AND plan_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(plan_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to get plan", e))?
    .ok_or_else(|| BillingError::not_found("plan", plan_id))?;

    let staged = sqlx::query_as::<_, CampaignPriceRow>(
        r#"
        SELECT plan_id, period_number, price
        FROM plan_campaign_prices
        WHERE plan_id = $1
        ORDER BY period_number
        "#,
    )
    .bind(plan_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to get campaign prices", e))?;

    timer.observe_duration();

    PricingCatalog::from_plan(&plan, &staged)
}

/// The client's enrollment row, or the never-enrolled value when there is none.
#[instrument(skip(conn), fields(client_id = %client_id))]
pub async fn load_enrollment(
    conn: &mut PgConnection,
    client_id: Uuid,
) -> Result<CampaignEnrollment, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["load_enrollment"])
        .start_timer();

    let enrollment = sqlx::query_as::<_, CampaignEnrollment>(
        r#"
        SELECT client_id, plan_id, enrolled, enrolled_at, periods_consumed, campaign_length_snapshot
        FROM campaign_enrollments
        WHERE client_id = $1
        "#,
    )
    .bind(client_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to get enrollment", e))?;

    timer.observe_duration();

    Ok(enrollment.unwrap_or_else(|| CampaignEnrollment::none(client_id)))
}

#[instrument(skip(conn), fields(tenant_id = %tenant_id))]
pub async fn load_referral_program(
    conn: &mut PgConnection,
    tenant_id: Uuid,
) -> Result<Option<ReferralProgram>, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["load_referral_program"])
        .start_timer();

    let program = sqlx::query_as::<_, ReferralProgram>(
        r#"
        SELECT tenant_id, active, max_discount_referrals, minimum_invoice_price, discount_per_referral
        FROM referral_programs
        WHERE tenant_id = $1
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to get referral program", e))?;

    timer.observe_duration();

    Ok(program)
}

/// Entries earned by `referrer_id`, oldest first.
#[instrument(skip(conn), fields(tenant_id = %tenant_id, referrer_id = %referrer_id))]
pub async fn load_referrer_entries(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    referrer_id: Uuid,
) -> Result<Vec<ReferralEntry>, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["load_referrer_entries"])
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
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to get referral entries", e))?;

    timer.observe_duration();

    Ok(entries)
}

/// Entries naming `referred_id` as the referred client, locked for the flip.
#[instrument(skip(conn), fields(tenant_id = %tenant_id, referred_id = %referred_id))]
pub async fn lock_referred_entries(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    referred_id: Uuid,
) -> Result<Vec<ReferralEntry>, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_referred_entries"])
        .start_timer();

    let entries = sqlx::query_as::<_, ReferralEntry>(
        r#"
        SELECT entry_id, tenant_id, referrer_id, referred_id, discount_amount, active, created_utc
        FROM referral_discounts
        WHERE tenant_id = $1 AND referred_id = $2
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(referred_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to get referred entries", e))?;

    timer.observe_duration();

    Ok(entries)
}

/// Write back an invoice's state, amount and snapshots.
#[instrument(skip(conn, invoice), fields(invoice_id = %invoice.invoice_id))]
pub async fn update_invoice(conn: &mut PgConnection, invoice: &Invoice) -> Result<(), BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["update_invoice"])
        .start_timer();

    sqlx::query(
        r#"
        UPDATE invoices
        SET amount = $2,
            paid = $3,
            paid_at = $4,
            cancelled = $5,
            cancelled_at = $6,
            base_price_snapshot = $7,
            campaign_discount_snapshot = $8,
            referral_discount_snapshot = $9,
            campaign_period_index = $10,
            updated_utc = NOW()
        WHERE invoice_id = $1
        "#,
    )
    .bind(invoice.invoice_id)
    .bind(invoice.amount)
    .bind(invoice.paid)
    .bind(invoice.paid_at)
    .bind(invoice.cancelled)
    .bind(invoice.cancelled_at)
    .bind(invoice.base_price_snapshot)
    .bind(invoice.campaign_discount_snapshot)
    .bind(invoice.referral_discount_snapshot)
    .bind(invoice.campaign_period_index)
    .execute(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to update invoice", e))?;

    timer.observe_duration();

    Ok(())
}

/// Insert a new open invoice. Returns `None` when the client already has an open
/// invoice (the one-open-invoice index rejected it).
#[instrument(skip(conn, invoice), fields(client_id = %invoice.client_id, due_date = %invoice.due_date))]
pub async fn insert_invoice(
    conn: &mut PgConnection,
    invoice: &NewInvoice,
) -> Result<Option<Invoice>, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_invoice"])
        .start_timer();

    let inserted = sqlx::query_as::<_, Invoice>(
        r#"
        INSERT INTO invoices (invoice_id, tenant_id, client_id, amount, due_date,
                              base_price_snapshot, campaign_discount_snapshot, referral_discount_snapshot, campaign_period_index)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (client_id) WHERE NOT paid AND NOT cancelled DO NOTHING
        RETURNING invoice_id, tenant_id, client_id, amount, due_date, paid, paid_at, cancelled, cancelled_at,
                  base_price_snapshot, campaign_discount_snapshot, referral_discount_snapshot, campaign_period_index,
                  created_utc, updated_utc
        "#,
    )
    .bind(invoice.invoice_id)
    .bind(invoice.tenant_id)
    .bind(invoice.client_id)
    .bind(invoice.amount)
    .bind(invoice.due_date)
    .bind(invoice.base_price_snapshot)
    .bind(invoice.campaign_discount_snapshot)
    .bind(invoice.referral_discount_snapshot)
    .bind(invoice.campaign_period_index)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to insert invoice", e))?;

    timer.observe_duration();

    Ok(inserted)
}

#[instrument(skip(conn, client), fields(client_id = %client.client_id))]
pub async fn update_client(conn: &mut PgConnection, client: &Client) -> Result<(), BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["update_client"])
        .start_timer();

    sqlx::query(
        r#"
        UPDATE clients
        SET plan_id = $2,
            due_date = $3,
            cancelled = $4,
            cancelled_at = $5,
            payment_method = $6,
            updated_utc = NOW()
        WHERE client_id = $1
        "#,
    )
    .bind(client.client_id)
    .bind(client.plan_id)
    .bind(client.due_date)
    .bind(client.cancelled)
    .bind(client.cancelled_at)
    .bind(&client.payment_method)
    .execute(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to update client", e))?;

    timer.observe_duration();

    Ok(())
}

#[instrument(skip(conn, enrollment), fields(client_id = %enrollment.client_id))]
pub async fn save_enrollment(
    conn: &mut PgConnection,
    enrollment: &CampaignEnrollment,
) -> Result<(), BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["save_enrollment"])
        .start_timer();

    sqlx::query(
        r#"
        INSERT INTO campaign_enrollments (client_id, plan_id, enrolled, enrolled_at, periods_consumed, campaign_length_snapshot)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (client_id) DO UPDATE
        SET plan_id = EXCLUDED.plan_id,
            enrolled = EXCLUDED.enrolled,
            enrolled_at = EXCLUDED.enrolled_at,
            periods_consumed = EXCLUDED.periods_consumed,
            campaign_length_snapshot = EXCLUDED.campaign_length_snapshot,
            updated_utc = NOW()
        "#,
    )
    .bind(enrollment.client_id)
    .bind(enrollment.plan_id)
    .bind(enrollment.enrolled)
    .bind(enrollment.enrolled_at)
    .bind(enrollment.periods_consumed)
    .bind(enrollment.campaign_length_snapshot)
    .execute(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to save enrollment", e))?;

    timer.observe_duration();

    Ok(())
}

/// Persist the `active` flag of each changed ledger entry.
#[instrument(skip(conn, entries), fields(count = entries.len()))]
pub async fn save_referral_flags(
    conn: &mut PgConnection,
    entries: &[ReferralEntry],
) -> Result<(), BillingError> {
    if entries.is_empty() {
        return Ok(());
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["save_referral_flags"])
        .start_timer();

    for entry in entries {
        sqlx::query("UPDATE referral_discounts SET active = $2 WHERE entry_id = $1")
            .bind(entry.entry_id)
            .bind(entry.active)
            .execute(&mut *conn)
            .await
            .map_err(|e| BillingError::database("Failed to update referral entry", e))?;
    }

    timer.observe_duration();

    Ok(())
}

/// Record a referral grant. Returns `None` if the pair already has an entry.
/// `active` follows the referred client's current cancellation state.
#[instrument(skip(conn, grant), fields(referrer_id = %grant.referrer_id, referred_id = %grant.referred_id))]
pub async fn insert_referral_grant(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    grant: &ReferralGrant,
    active: bool,
) -> Result<Option<ReferralEntry>, BillingError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_referral_grant"])
        .start_timer();

    let entry = sqlx::query_as::<_, ReferralEntry>(
        r#"
        INSERT INTO referral_discounts (entry_id, tenant_id, referrer_id, referred_id, discount_amount, active)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (referrer_id, referred_id) DO NOTHING
        RETURNING entry_id, tenant_id, referrer_id, referred_id, discount_amount, active, created_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(grant.referrer_id)
    .bind(grant.referred_id)
    .bind(grant.discount_amount)
    .bind(active)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| BillingError::database("Failed to insert referral grant", e))?;

    timer.observe_duration();

    Ok(entry)
}
