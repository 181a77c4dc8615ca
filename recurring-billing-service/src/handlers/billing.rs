//! Billing handlers. Every route is scoped to the tenant from `X-Tenant-ID`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::{
        ChangePlanRequest, EffectiveDateRequest, PayInvoiceRequest, ReactivateRequest,
        ReprocessRequest,
    },
    error::BillingError,
    middleware::{OptionalJson, TenantContext},
    services::{
        record_error, CancelOutcome, FirstInvoiceOutcome, MarkPaidOutcome, PlanChangeOutcome,
        PricePreview, ReactivateOutcome, ReprocessSummary,
    },
    startup::AppState,
};

/// Count the failure under `operation` and render it through `AppError`.
fn failed(operation: &'static str) -> impl Fn(BillingError) -> AppError {
    move |err| {
        record_error(err.kind(), operation);
        tracing::warn!(error = %err, operation, "Billing operation failed");
        AppError::from(err)
    }
}

/// Open the first invoice for a newly signed-up client.
pub async fn create_first_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(client_id): Path<Uuid>,
    OptionalJson(request): OptionalJson<EffectiveDateRequest>,
) -> Result<(StatusCode, Json<FirstInvoiceOutcome>), AppError> {

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        client_id = %client_id,
        "Creating first invoice"
    );

    let outcome = state
        .billing
        .create_first_invoice(tenant.tenant_id, client_id, request.effective_on())
        .await
        .map_err(failed("create_first_invoice"))?;

    let status = match outcome {
        FirstInvoiceOutcome::Created { .. } => StatusCode::CREATED,
        FirstInvoiceOutcome::Unchanged { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// Mark an invoice paid. Repeating the call for a settled invoice is a no-op.
pub async fn pay_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
    OptionalJson(request): OptionalJson<PayInvoiceRequest>,
) -> Result<(StatusCode, Json<MarkPaidOutcome>), AppError> {
    let paid_at = request.paid_on();

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        invoice_id = %invoice_id,
        paid_at = %paid_at,
        "Marking invoice paid"
    );

    let outcome = state
        .billing
        .mark_paid(tenant.tenant_id, invoice_id, paid_at)
        .await
        .map_err(failed("mark_paid"))?;

    let status = match outcome {
        MarkPaidOutcome::InProgress { .. } => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

pub async fn cancel_client(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(client_id): Path<Uuid>,
    OptionalJson(request): OptionalJson<EffectiveDateRequest>,
) -> Result<Json<CancelOutcome>, AppError> {

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        client_id = %client_id,
        "Cancelling client"
    );

    let outcome = state
        .billing
        .cancel(tenant.tenant_id, client_id, request.effective_on())
        .await
        .map_err(failed("cancel"))?;

    Ok(Json(outcome))
}

pub async fn reactivate_client(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(client_id): Path<Uuid>,
    OptionalJson(request): OptionalJson<ReactivateRequest>,
) -> Result<Json<ReactivateOutcome>, AppError> {
    request.validate()?;
    let on = request.effective_on();

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        client_id = %client_id,
        plan_id = ?request.plan_id,
        "Reactivating client"
    );

    let outcome = state
        .billing
        .reactivate(
            tenant.tenant_id,
            client_id,
            request.payment_method,
            request.plan_id,
            on,
        )
        .await
        .map_err(failed("reactivate"))?;

    Ok(Json(outcome))
}

pub async fn change_plan(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(client_id): Path<Uuid>,
    Json(request): Json<ChangePlanRequest>,
) -> Result<Json<PlanChangeOutcome>, AppError> {
    request.validate()?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        client_id = %client_id,
        plan_id = %request.plan_id,
        "Changing plan"
    );

    let outcome = state
        .billing
        .change_plan(
            tenant.tenant_id,
            client_id,
            request.plan_id,
            request.effective_on(),
        )
        .await
        .map_err(failed("change_plan"))?;

    Ok(Json(outcome))
}

/// Price the client's next invoice would carry, without creating it.
pub async fn price_preview(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(client_id): Path<Uuid>,
) -> Result<Json<PricePreview>, AppError> {
    let preview = state
        .billing
        .resolve_price_preview(tenant.tenant_id, client_id)
        .await
        .map_err(failed("price_preview"))?;

    Ok(Json(preview))
}

/// Replay payments for a batch of invoices. Stops early on shutdown.
pub async fn reprocess_invoices(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(request): Json<ReprocessRequest>,
) -> Result<Json<ReprocessSummary>, AppError> {
    request.validate()?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        count = request.invoice_ids.len(),
        "Reprocessing invoice payments"
    );

    let summary = state
        .billing
        .reprocess_payments(
            tenant.tenant_id,
            &request.invoice_ids,
            request.paid_on(),
            &state.shutdown,
        )
        .await;

    Ok(Json(summary))
}
