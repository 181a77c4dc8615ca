//! Invoice and client billing state transitions.
//!
//! Every transition here is a pure function: it receives the client's current billing
//! picture and returns the rows to write plus the events to emit. Nothing is persisted or
//! dispatched here; the caller does both, in that order, inside one database transaction.
//!
//! Invoice states: `open` → `paid` (spawns the successor) or `open` → `cancelled`.

use crate::engine::calendar::{advance_due_date, days_between, first_day_of_month};
use crate::engine::campaign::{
    apply_reactivation_policy, enroll_if_eligible, record_paid_period, terminate,
    ReactivationPolicyOutcome,
};
use crate::engine::events::BillingEvent;
use crate::engine::pricing::resolve;
use crate::engine::referral::{
    grant_for_first_payment, on_referred_client_cancel, on_referred_client_reactivate,
    ReferralDiscountLedger,
};
use crate::error::BillingError;
use crate::models::{
    CampaignEnrollment, Client, Invoice, NewInvoice, PricingCatalog, ReferralEntry,
    ReferralGrant,
};
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

/// Grace windows, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Payments later than this after the due date settle a lapsed period.
    pub late_payment_grace_days: i64,
    /// Reactivations within this many days of cancelling keep the client's campaign.
    pub reactivation_grace_days: i64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            late_payment_grace_days: 7,
            reactivation_grace_days: 7,
        }
    }
}

/// A client's billing picture at the moment of a transition.
#[derive(Debug, Clone, Copy)]
pub struct ClientBilling<'a> {
    pub client: &'a Client,
    pub catalog: &'a PricingCatalog,
    pub enrollment: &'a CampaignEnrollment,
    /// Entries where this client is the referrer.
    pub ledger: &'a ReferralDiscountLedger,
    /// Every invoice of this client that is currently open.
    pub open_invoices: &'a [Invoice],
}

/// Why a paid invoice did not get a successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessorSkip {
    ClientCancelled,
    /// Another open invoice already exists (a successor from an earlier attempt, or arrears).
    OpenInvoiceExists(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    OnTime,
    /// Paid more than the late-payment grace after its due date.
    Late,
}

#[derive(Debug, Clone)]
pub struct PaymentTransition {
    pub invoice: Invoice,
    pub settlement: Settlement,
    pub enrollment: CampaignEnrollment,
    pub successor: Option<NewInvoice>,
    pub skipped: Option<SuccessorSkip>,
    pub referral_grant: Option<ReferralGrant>,
    pub events: Vec<BillingEvent>,
}

#[derive(Debug, Clone)]
pub struct CancellationTransition {
    pub client: Client,
    pub cancelled_invoices: Vec<Invoice>,
    pub deactivated_referrals: Vec<ReferralEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReactivationRequest<'a> {
    pub payment_method: Option<&'a str>,
    /// A plan adopted as part of reactivating; enrolls in its campaign when eligible.
    pub readopted_plan: Option<&'a PricingCatalog>,
    pub on: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct ReactivationTransition {
    pub client: Client,
    pub enrollment: CampaignEnrollment,
    pub policy_outcome: ReactivationPolicyOutcome,
    pub enrolled_on_readoption: bool,
    pub reopened_invoice: Option<Invoice>,
    pub new_invoice: Option<NewInvoice>,
    pub reactivated_referrals: Vec<ReferralEntry>,
    pub events: Vec<BillingEvent>,
}

#[derive(Debug, Clone)]
pub struct PlanChangeTransition {
    pub client: Client,
    pub enrollment: CampaignEnrollment,
    pub enrolled: bool,
    pub repriced_invoice: Option<Invoice>,
}

#[derive(Debug, Clone)]
pub struct FirstInvoiceTransition {
    pub enrollment: CampaignEnrollment,
    pub invoice: NewInvoice,
    pub events: Vec<BillingEvent>,
}

fn invalid_invoice_transition(invoice: &Invoice) -> BillingError {
    BillingError::InvalidTransition {
        entity: "invoice",
        id: invoice.invoice_id,
        state: invoice.state().to_string(),
    }
}

fn invoice_created(invoice: &NewInvoice) -> BillingEvent {
    BillingEvent::InvoiceCreated {
        tenant_id: invoice.tenant_id,
        client_id: invoice.client_id,
        invoice_id: invoice.invoice_id,
        amount: invoice.amount,
        due_date: invoice.due_date,
    }
}

/// Build the invoice one plan period after `baseline`, priced now.
pub fn spawn_next(
    client: &Client,
    catalog: &PricingCatalog,
    enrollment: &CampaignEnrollment,
    ledger: &ReferralDiscountLedger,
    baseline: NaiveDate,
) -> Result<NewInvoice, BillingError> {
    let due_date = advance_due_date(baseline, catalog.period)?;
    let resolution = resolve(catalog, enrollment, ledger)?;
    Ok(NewInvoice::priced(
        client.tenant_id,
        client.client_id,
        due_date,
        &resolution,
    ))
}

/// `open → paid`.
///
/// The campaign counter advances before the successor is priced, so the successor of the
/// last campaign invoice is already priced outside the campaign. A successor is spawned
/// only when no other invoice is open. On-time payments keep the invoice's own due date
/// as the baseline (early payers are not charged sooner); late payments resume from the
/// client's anchor, rebased to the payment date.
pub fn mark_paid(
    billing: &ClientBilling<'_>,
    invoice: &Invoice,
    paid_at: NaiveDate,
    prior_paid_invoices: i64,
    policy: &LifecyclePolicy,
) -> Result<PaymentTransition, BillingError> {
    if !invoice.is_open() {
        return Err(invalid_invoice_transition(invoice));
    }

    let client = billing.client;
    let mut paid = invoice.clone();
    paid.paid = true;
    paid.paid_at = Some(paid_at);

    let mut events = vec![BillingEvent::InvoicePaid {
        tenant_id: invoice.tenant_id,
        client_id: invoice.client_id,
        invoice_id: invoice.invoice_id,
        amount: invoice.amount,
        paid_at,
    }];

    let mut referral_grant = None;
    if prior_paid_invoices == 0 {
        events.push(BillingEvent::FirstInvoicePaid {
            tenant_id: invoice.tenant_id,
            client_id: invoice.client_id,
            invoice_id: invoice.invoice_id,
        });
        referral_grant = grant_for_first_payment(client, billing.ledger.program());
        if let Some(grant) = &referral_grant {
            events.push(BillingEvent::ReferralDiscountGranted {
                tenant_id: client.tenant_id,
                referrer_id: grant.referrer_id,
                referred_id: grant.referred_id,
                discount_amount: grant.discount_amount,
            });
        }
    }

    let mut enrollment = billing.enrollment.clone();
    let enrolled_plan = enrollment.plan_id;
    if let Some(periods) = record_paid_period(
        &mut enrollment,
        billing.catalog.plan_id,
        invoice.campaign_period_index,
    )? {
        events.push(BillingEvent::CampaignCompleted {
            tenant_id: client.tenant_id,
            client_id: client.client_id,
            plan_id: enrolled_plan,
            periods,
        });
    }

    let settlement = if days_between(invoice.due_date, paid_at) > policy.late_payment_grace_days {
        Settlement::Late
    } else {
        Settlement::OnTime
    };

    let other_open = billing
        .open_invoices
        .iter()
        .filter(|open| open.invoice_id != invoice.invoice_id && open.is_open())
        // a later-dated open invoice is the normal duplicate case; report it first
        .max_by_key(|open| open.due_date);

    let skipped = if client.cancelled {
        Some(SuccessorSkip::ClientCancelled)
    } else {
        other_open.map(|open| SuccessorSkip::OpenInvoiceExists(open.invoice_id))
    };

    let successor = match skipped {
        Some(_) => None,
        None => {
            let baseline = match settlement {
                Settlement::OnTime => invoice.due_date.max(paid_at),
                Settlement::Late => client.due_date.max(paid_at),
            };
            let next = spawn_next(
                client,
                billing.catalog,
                &enrollment,
                billing.ledger,
                baseline,
            )?;
            events.push(invoice_created(&next));
            Some(next)
        }
    };

    Ok(PaymentTransition {
        invoice: paid,
        settlement,
        enrollment,
        successor,
        skipped,
        referral_grant,
        events,
    })
}

/// Cancel a client. Only open invoices due on or after the first day of the current month
/// are cancelled; older arrears stay open. Referral entries naming this client as the
/// referred party stop contributing.
pub fn cancel_client(
    client: &Client,
    open_invoices: &[Invoice],
    referred_entries: &[ReferralEntry],
    on: NaiveDate,
) -> Result<CancellationTransition, BillingError> {
    if client.cancelled {
        return Err(BillingError::InvalidTransition {
            entity: "client",
            id: client.client_id,
            state: "cancelled".to_string(),
        });
    }

    let mut cancelled_client = client.clone();
    cancelled_client.cancelled = true;
    cancelled_client.cancelled_at = Some(on);

    let cutoff = first_day_of_month(on);
    let cancelled_invoices = open_invoices
        .iter()
        .filter(|invoice| invoice.is_open() && invoice.due_date >= cutoff)
        .map(|invoice| {
            let mut cancelled = invoice.clone();
            cancelled.cancelled = true;
            cancelled.cancelled_at = Some(on);
            cancelled
        })
        .collect();

    let mut entries = referred_entries.to_vec();
    let deactivated_referrals = on_referred_client_cancel(&mut entries, client.client_id);

    Ok(CancellationTransition {
        client: cancelled_client,
        cancelled_invoices,
        deactivated_referrals,
    })
}

/// Reactivate a cancelled client.
///
/// Never spawns a successor. The client ends with exactly one open invoice: an existing
/// open one is kept, otherwise the invoice cancelled by the client's own cancellation is
/// reopened (if not yet due), otherwise a new invoice due on the reactivation date is created.
pub fn reactivate_client(
    billing: &ClientBilling<'_>,
    reopenable: Option<&Invoice>,
    referred_entries: &[ReferralEntry],
    request: ReactivationRequest<'_>,
    policy: &LifecyclePolicy,
) -> Result<ReactivationTransition, BillingError> {
    let client = billing.client;
    if !client.cancelled {
        return Err(BillingError::InvalidTransition {
            entity: "client",
            id: client.client_id,
            state: "active".to_string(),
        });
    }

    let mut enrollment = billing.enrollment.clone();
    let policy_outcome = apply_reactivation_policy(
        &mut enrollment,
        client.cancelled_at,
        request.on,
        policy.reactivation_grace_days,
    );

    let mut reactivated = client.clone();
    let catalog = request.readopted_plan.unwrap_or(billing.catalog);
    let mut enrolled_on_readoption = false;
    if let Some(plan) = request.readopted_plan {
        if enrollment.enrolled && enrollment.plan_id != Some(plan.plan_id) {
            terminate(&mut enrollment);
        }
        reactivated.plan_id = Some(plan.plan_id);
        enrolled_on_readoption = enroll_if_eligible(&mut enrollment, plan, request.on);
    }

    reactivated.cancelled = false;
    reactivated.cancelled_at = None;
    if let Some(method) = request.payment_method {
        reactivated.payment_method = Some(method.to_string());
    }

    let mut entries = referred_entries.to_vec();
    let reactivated_referrals = on_referred_client_reactivate(&mut entries, client.client_id);

    let mut events = Vec::new();
    let mut reopened_invoice = None;
    let mut new_invoice = None;

    let has_open = billing.open_invoices.iter().any(Invoice::is_open);
    if !has_open {
        let resolution = resolve(catalog, &enrollment, billing.ledger)?;
        match reopenable.filter(|inv| inv.cancelled && !inv.paid && inv.due_date >= request.on) {
            Some(invoice) => {
                let mut reopened = invoice.clone();
                reopened.cancelled = false;
                reopened.cancelled_at = None;
                reopened.reprice(&resolution);
                reactivated.due_date = reopened.due_date;
                reopened_invoice = Some(reopened);
            }
            None => {
                let invoice = NewInvoice::priced(
                    client.tenant_id,
                    client.client_id,
                    request.on,
                    &resolution,
                );
                reactivated.due_date = invoice.due_date;
                events.push(invoice_created(&invoice));
                new_invoice = Some(invoice);
            }
        }
    }

    Ok(ReactivationTransition {
        client: reactivated,
        enrollment,
        policy_outcome,
        enrolled_on_readoption,
        reopened_invoice,
        new_invoice,
        reactivated_referrals,
        events,
    })
}

/// Move a client to another plan. Ends any enrollment, enrolls on the new plan's campaign
/// when eligible, and re-prices the open invoice if it is not yet past due.
pub fn change_plan(
    client: &Client,
    enrollment: &CampaignEnrollment,
    new_plan: &PricingCatalog,
    ledger: &ReferralDiscountLedger,
    open_invoices: &[Invoice],
    on: NaiveDate,
) -> Result<PlanChangeTransition, BillingError> {
    if client.cancelled {
        return Err(BillingError::InvalidPlanChange(format!(
            "client {} is cancelled",
            client.client_id
        )));
    }
    let Some(current_plan) = client.plan_id else {
        return Err(BillingError::InvalidPlanChange(format!(
            "client {} has no plan",
            client.client_id
        )));
    };
    if current_plan == new_plan.plan_id {
        return Err(BillingError::InvalidTransition {
            entity: "client",
            id: client.client_id,
            state: format!("on plan {}", new_plan.plan_id),
        });
    }

    let mut changed = client.clone();
    changed.plan_id = Some(new_plan.plan_id);

    let mut next_enrollment = enrollment.clone();
    terminate(&mut next_enrollment);
    let enrolled = enroll_if_eligible(&mut next_enrollment, new_plan, on);

    let repriced_invoice = match open_invoices
        .iter()
        .filter(|invoice| invoice.is_open() && invoice.due_date >= on)
        .max_by_key(|invoice| invoice.due_date)
    {
        Some(open) => {
            let resolution = resolve(new_plan, &next_enrollment, ledger)?;
            let mut repriced = open.clone();
            repriced.reprice(&resolution);
            Some(repriced)
        }
        None => None,
    };

    Ok(PlanChangeTransition {
        client: changed,
        enrollment: next_enrollment,
        enrolled,
        repriced_invoice,
    })
}

/// Signup: enroll on the adopted plan's campaign when eligible and open the first invoice,
/// due on the client's anchor date.
pub fn open_first_invoice(
    billing: &ClientBilling<'_>,
    on: NaiveDate,
) -> Result<FirstInvoiceTransition, BillingError> {
    let client = billing.client;
    if client.cancelled {
        return Err(BillingError::InvalidTransition {
            entity: "client",
            id: client.client_id,
            state: "cancelled".to_string(),
        });
    }
    if let Some(open) = billing.open_invoices.iter().find(|inv| inv.is_open()) {
        return Err(invalid_invoice_transition(open));
    }

    let mut enrollment = billing.enrollment.clone();
    enroll_if_eligible(&mut enrollment, billing.catalog, on);

    let resolution = resolve(billing.catalog, &enrollment, billing.ledger)?;
    let invoice = NewInvoice::priced(
        client.tenant_id,
        client.client_id,
        client.due_date,
        &resolution,
    );
    let events = vec![invoice_created(&invoice)];

    Ok(FirstInvoiceTransition {
        enrollment,
        invoice,
        events,
    })
}
