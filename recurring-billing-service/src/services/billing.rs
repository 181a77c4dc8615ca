//! Billing orchestration.
//!
//! Each operation runs one engine transition inside one Postgres transaction: lock, load,
//! transition, persist, commit. Events are handed to the notifier only after the commit.

use crate::config::ReferralDefaults;
use crate::engine::campaign::ReactivationPolicyOutcome;
use crate::engine::lifecycle::{self, ClientBilling, LifecyclePolicy, ReactivationRequest, Settlement};
use crate::engine::{resolve, BillingEvent, PriceResolution, ReferralDiscountLedger};
use crate::error::BillingError;
use crate::models::{CampaignEnrollment, Client, Invoice, PricingCatalog};
use crate::services::database::Database;
use crate::services::metrics::{record_error, record_invoice_created, record_transition};
use crate::services::notifier::{dispatch, EventNotifier};
use crate::services::store;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::PgConnection;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MarkPaidOutcome {
    Paid {
        invoice: Invoice,
        settlement: Settlement,
        successor: Option<Invoice>,
    },
    /// The invoice was already paid or cancelled; nothing changed.
    AlreadySettled { invoice: Invoice },
    /// Another transaction holds the invoice; this is its last committed state.
    InProgress { invoice: Invoice },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled {
        client: Client,
        cancelled_invoices: Vec<Invoice>,
    },
    AlreadyCancelled { client: Client },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReactivateOutcome {
    Reactivated {
        client: Client,
        open_invoice: Option<Invoice>,
        campaign: ReactivationPolicyOutcome,
        enrolled_on_readoption: bool,
    },
    AlreadyActive { client: Client },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanChangeOutcome {
    Changed {
        client: Client,
        enrolled: bool,
        repriced_invoice: Option<Invoice>,
    },
    Unchanged { client: Client },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FirstInvoiceOutcome {
    Created { invoice: Invoice },
    /// The client is cancelled or already has an open invoice.
    Unchanged {
        client: Client,
        open_invoice: Option<Invoice>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PricePreview {
    pub client_id: Uuid,
    pub plan_id: Uuid,
    #[serde(flatten)]
    pub resolution: PriceResolution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReprocessSummary {
    pub processed: usize,
    pub succeeded: usize,
    /// Already paid or cancelled.
    pub skipped: usize,
    pub in_progress: usize,
    pub failed: usize,
    /// Not attempted because the run was cancelled.
    pub cancelled: usize,
}

/// Everything a transition needs about one client, loaded inside the transaction.
struct BillingSnapshot {
    client: Client,
    catalog: PricingCatalog,
    enrollment: CampaignEnrollment,
    ledger: ReferralDiscountLedger,
    open_invoices: Vec<Invoice>,
}

impl BillingSnapshot {
    fn view(&self) -> ClientBilling<'_> {
        ClientBilling {
            client: &self.client,
            catalog: &self.catalog,
            enrollment: &self.enrollment,
            ledger: &self.ledger,
            open_invoices: &self.open_invoices,
        }
    }
}

fn require_plan(client: &Client) -> Result<Uuid, BillingError> {
    client.plan_id.ok_or_else(|| {
        BillingError::InvalidPlanChange(format!("client {} has no plan", client.client_id))
    })
}

#[derive(Clone)]
pub struct BillingService {
    db: Arc<Database>,
    notifier: Arc<dyn EventNotifier>,
    policy: LifecyclePolicy,
    referral_defaults: ReferralDefaults,
}

impl BillingService {
    pub fn new(
        db: Arc<Database>,
        notifier: Arc<dyn EventNotifier>,
        policy: LifecyclePolicy,
        referral_defaults: ReferralDefaults,
    ) -> Self {
        Self {
            db,
            notifier,
            policy,
            referral_defaults,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    async fn load_ledger(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        referrer_id: Uuid,
    ) -> Result<ReferralDiscountLedger, BillingError> {
        let program = store::load_referral_program(&mut *conn, tenant_id)
            .await?
            .unwrap_or_else(|| self.referral_defaults.program_for(tenant_id));
        let entries = store::load_referrer_entries(&mut *conn, tenant_id, referrer_id).await?;
        Ok(ReferralDiscountLedger::new(entries, program))
    }

    async fn load_snapshot(
        &self,
        conn: &mut PgConnection,
        client: Client,
        catalog: PricingCatalog,
    ) -> Result<BillingSnapshot, BillingError> {
        let enrollment = store::load_enrollment(&mut *conn, client.client_id).await?;
        let ledger = self
            .load_ledger(&mut *conn, client.tenant_id, client.client_id)
            .await?;
        let open_invoices =
            store::lock_open_invoices(&mut *conn, client.tenant_id, client.client_id).await?;

        Ok(BillingSnapshot {
            client,
            catalog,
            enrollment,
            ledger,
            open_invoices,
        })
    }

    async fn current_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, BillingError> {
        self.db
            .get_invoice(tenant_id, invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
    }

    /// Mark an invoice paid and spawn its successor.
    ///
    /// Paying an invoice that is already settled is a no-op; paying one that another
    /// request is processing reports `InProgress` with the last committed state.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn mark_paid(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        paid_at: NaiveDate,
    ) -> Result<MarkPaidOutcome, BillingError> {
        let tenant = tenant_id.to_string();
        let mut tx = self.db.begin().await?;

        let invoice = match store::lock_invoice(&mut *tx, tenant_id, invoice_id).await {
            Ok(invoice) => invoice,
            Err(BillingError::ConcurrentModification(_)) => {
                tx.rollback().await.ok();
                info!("Invoice is locked by another payment, reporting in progress");
                record_transition(&tenant, "mark_paid", "in_progress");
                let invoice = self.current_invoice(tenant_id, invoice_id).await?;
                return Ok(MarkPaidOutcome::InProgress { invoice });
            }
            Err(e) => return Err(e),
        };

        if !invoice.is_open() {
            tx.rollback().await.ok();
            record_transition(&tenant, "mark_paid", "already_settled");
            return Ok(MarkPaidOutcome::AlreadySettled { invoice });
        }

        let client = store::lock_client(&mut *tx, tenant_id, invoice.client_id).await?;
        let catalog = store::load_catalog(&mut *tx, tenant_id, require_plan(&client)?).await?;
        let mut snapshot = self.load_snapshot(&mut *tx, client, catalog).await?;
        let prior_paid = store::count_paid_invoices(&mut *tx, invoice.client_id).await?;

        let transition =
            match lifecycle::mark_paid(&snapshot.view(), &invoice, paid_at, prior_paid, &self.policy) {
                Ok(transition) => transition,
                Err(BillingError::InvalidTransition { .. }) => {
                    tx.rollback().await.ok();
                    record_transition(&tenant, "mark_paid", "already_settled");
                    return Ok(MarkPaidOutcome::AlreadySettled { invoice });
                }
                Err(e) => return Err(e),
            };

        store::update_invoice(&mut *tx, &transition.invoice).await?;
        store::save_enrollment(&mut *tx, &transition.enrollment).await?;

        let mut events = transition.events;
        let mut successor = None;
        if let Some(next) = &transition.successor {
            match store::insert_invoice(&mut *tx, next).await? {
                Some(inserted) => {
                    snapshot.client.due_date = inserted.due_date;
                    store::update_client(&mut *tx, &snapshot.client).await?;
                    successor = Some(inserted);
                }
                None => {
                    warn!(
                        client_id = %snapshot.client.client_id,
                        "Successor already exists, skipping creation"
                    );
                    events.retain(|event| !matches!(event, BillingEvent::InvoiceCreated { .. }));
                }
            }
        }
        if let Some(skip) = transition.skipped {
            info!(reason = ?skip, "No successor spawned");
        }

        if let Some(grant) = &transition.referral_grant {
            let stored =
                store::insert_referral_grant(&mut *tx, tenant_id, grant, !snapshot.client.cancelled)
                    .await?;
            if stored.is_none() {
                events.retain(|event| {
                    !matches!(event, BillingEvent::ReferralDiscountGranted { .. })
                });
            }
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit transaction", e))?;

        record_transition(&tenant, "mark_paid", "paid");
        if successor.is_some() {
            record_invoice_created(&tenant, "successor");
        }
        info!(
            settlement = ?transition.settlement,
            successor_id = ?successor.as_ref().map(|s| s.invoice_id),
            "Invoice paid"
        );

        dispatch(&self.notifier, &events).await;

        Ok(MarkPaidOutcome::Paid {
            invoice: transition.invoice,
            settlement: transition.settlement,
            successor,
        })
    }

    /// Cancel a client: current-month open invoices are cancelled and referral entries
    /// naming the client stop contributing.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id))]
    pub async fn cancel(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
        on: NaiveDate,
    ) -> Result<CancelOutcome, BillingError> {
        let tenant = tenant_id.to_string();
        let mut tx = self.db.begin().await?;

        let client = store::lock_client(&mut *tx, tenant_id, client_id).await?;
        let open_invoices = store::lock_open_invoices(&mut *tx, tenant_id, client_id).await?;
        let referred = store::lock_referred_entries(&mut *tx, tenant_id, client_id).await?;

        let transition = match lifecycle::cancel_client(&client, &open_invoices, &referred, on) {
            Ok(transition) => transition,
            Err(BillingError::InvalidTransition { .. }) => {
                tx.rollback().await.ok();
                record_transition(&tenant, "cancel", "already_cancelled");
                return Ok(CancelOutcome::AlreadyCancelled { client });
            }
            Err(e) => return Err(e),
        };

        for invoice in &transition.cancelled_invoices {
            store::update_invoice(&mut *tx, invoice).await?;
        }
        store::update_client(&mut *tx, &transition.client).await?;
        store::save_referral_flags(&mut *tx, &transition.deactivated_referrals).await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit transaction", e))?;

        record_transition(&tenant, "cancel", "cancelled");
        info!(
            cancelled_invoices = transition.cancelled_invoices.len(),
            deactivated_referrals = transition.deactivated_referrals.len(),
            "Client cancelled"
        );

        Ok(CancelOutcome::Cancelled {
            client: transition.client,
            cancelled_invoices: transition.cancelled_invoices,
        })
    }

    /// Reactivate a cancelled client, optionally re-adopting a plan.
    #[instrument(skip(self, payment_method), fields(tenant_id = %tenant_id, client_id = %client_id))]
    pub async fn reactivate(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
        payment_method: Option<String>,
        plan_id: Option<Uuid>,
        on: NaiveDate,
    ) -> Result<ReactivateOutcome, BillingError> {
        let tenant = tenant_id.to_string();
        let mut tx = self.db.begin().await?;

        let client = store::lock_client(&mut *tx, tenant_id, client_id).await?;
        if !client.cancelled {
            tx.rollback().await.ok();
            record_transition(&tenant, "reactivate", "already_active");
            return Ok(ReactivateOutcome::AlreadyActive { client });
        }

        let readopted = match plan_id {
            Some(plan_id) => Some(store::load_catalog(&mut *tx, tenant_id, plan_id).await?),
            None => None,
        };
        let current = match (client.plan_id, &readopted) {
            (Some(current_plan), Some(plan)) if plan.plan_id == current_plan => plan.clone(),
            (Some(current_plan), _) => store::load_catalog(&mut *tx, tenant_id, current_plan).await?,
            (None, Some(plan)) => plan.clone(),
            (None, None) => return Err(BillingError::InvalidPlanChange(format!(
                "client {} has no plan to reactivate on",
                client_id
            ))),
        };

        let reopenable = match client.cancelled_at {
            Some(cancelled_at) => {
                store::find_reopenable_invoice(&mut *tx, client_id, cancelled_at).await?
            }
            None => None,
        };
        let referred = store::lock_referred_entries(&mut *tx, tenant_id, client_id).await?;
        let snapshot = self.load_snapshot(&mut *tx, client, current).await?;

        let request = ReactivationRequest {
            payment_method: payment_method.as_deref(),
            readopted_plan: readopted.as_ref(),
            on,
        };
        let transition = match lifecycle::reactivate_client(
            &snapshot.view(),
            reopenable.as_ref(),
            &referred,
            request,
            &self.policy,
        ) {
            Ok(transition) => transition,
            Err(BillingError::InvalidTransition { .. }) => {
                tx.rollback().await.ok();
                record_transition(&tenant, "reactivate", "already_active");
                return Ok(ReactivateOutcome::AlreadyActive {
                    client: snapshot.client,
                });
            }
            Err(e) => return Err(e),
        };

        store::save_enrollment(&mut *tx, &transition.enrollment).await?;
        store::save_referral_flags(&mut *tx, &transition.reactivated_referrals).await?;

        let mut events = transition.events;
        let mut created = false;
        let mut open_invoice = snapshot.open_invoices.first().cloned();
        if let Some(reopened) = &transition.reopened_invoice {
            store::update_invoice(&mut *tx, reopened).await?;
            open_invoice = Some(reopened.clone());
        }
        if let Some(new_invoice) = &transition.new_invoice {
            match store::insert_invoice(&mut *tx, new_invoice).await? {
                Some(inserted) => {
                    created = true;
                    open_invoice = Some(inserted);
                }
                None => {
                    warn!("Client already has an open invoice, skipping creation");
                    events.retain(|event| !matches!(event, BillingEvent::InvoiceCreated { .. }));
                }
            }
        }
        store::update_client(&mut *tx, &transition.client).await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit transaction", e))?;

        record_transition(&tenant, "reactivate", "reactivated");
        if created {
            record_invoice_created(&tenant, "reactivation");
        }
        info!(
            campaign = ?transition.policy_outcome,
            reopened = transition.reopened_invoice.is_some(),
            "Client reactivated"
        );

        dispatch(&self.notifier, &events).await;

        Ok(ReactivateOutcome::Reactivated {
            client: transition.client,
            open_invoice,
            campaign: transition.policy_outcome,
            enrolled_on_readoption: transition.enrolled_on_readoption,
        })
    }

    /// Move a client to another plan and re-price its open invoice.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id, plan_id = %new_plan_id))]
    pub async fn change_plan(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
        new_plan_id: Uuid,
        on: NaiveDate,
    ) -> Result<PlanChangeOutcome, BillingError> {
        let tenant = tenant_id.to_string();
        let mut tx = self.db.begin().await?;

        let client = store::lock_client(&mut *tx, tenant_id, client_id).await?;
        let catalog = store::load_catalog(&mut *tx, tenant_id, new_plan_id).await?;
        let snapshot = self.load_snapshot(&mut *tx, client, catalog).await?;

        let transition = match lifecycle::change_plan(
            &snapshot.client,
            &snapshot.enrollment,
            &snapshot.catalog,
            &snapshot.ledger,
            &snapshot.open_invoices,
            on,
        ) {
            Ok(transition) => transition,
            Err(BillingError::InvalidTransition { .. }) => {
                tx.rollback().await.ok();
                record_transition(&tenant, "change_plan", "unchanged");
                return Ok(PlanChangeOutcome::Unchanged {
                    client: snapshot.client,
                });
            }
            Err(e) => return Err(e),
        };

        store::update_client(&mut *tx, &transition.client).await?;
        store::save_enrollment(&mut *tx, &transition.enrollment).await?;
        if let Some(invoice) = &transition.repriced_invoice {
            store::update_invoice(&mut *tx, invoice).await?;
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit transaction", e))?;

        record_transition(&tenant, "change_plan", "changed");
        info!(enrolled = transition.enrolled, "Plan changed");

        Ok(PlanChangeOutcome::Changed {
            client: transition.client,
            enrolled: transition.enrolled,
            repriced_invoice: transition.repriced_invoice,
        })
    }

    /// Price the client's next invoice would have if created now. Read-only.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id))]
    pub async fn resolve_price_preview(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
    ) -> Result<PricePreview, BillingError> {
        let client = self
            .db
            .get_client(tenant_id, client_id)
            .await?
            .ok_or_else(|| BillingError::not_found("client", client_id))?;
        let plan_id = require_plan(&client)?;

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| BillingError::database("Failed to acquire connection", e))?;

        let catalog = store::load_catalog(&mut conn, tenant_id, plan_id).await?;
        let enrollment = store::load_enrollment(&mut conn, client_id).await?;
        let ledger = self.load_ledger(&mut conn, tenant_id, client_id).await?;

        let resolution = resolve(&catalog, &enrollment, &ledger)?;

        Ok(PricePreview {
            client_id,
            plan_id,
            resolution,
        })
    }

    /// Signup: enroll on the client's plan campaign and open the first invoice.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, client_id = %client_id))]
    pub async fn create_first_invoice(
        &self,
        tenant_id: Uuid,
        client_id: Uuid,
        on: NaiveDate,
    ) -> Result<FirstInvoiceOutcome, BillingError> {
        let tenant = tenant_id.to_string();
        let mut tx = self.db.begin().await?;

        let client = store::lock_client(&mut *tx, tenant_id, client_id).await?;
        let catalog = store::load_catalog(&mut *tx, tenant_id, require_plan(&client)?).await?;
        let snapshot = self.load_snapshot(&mut *tx, client, catalog).await?;

        let transition = match lifecycle::open_first_invoice(&snapshot.view(), on) {
            Ok(transition) => transition,
            Err(BillingError::InvalidTransition { .. }) => {
                tx.rollback().await.ok();
                record_transition(&tenant, "first_invoice", "unchanged");
                let open_invoice = snapshot.open_invoices.first().cloned();
                return Ok(FirstInvoiceOutcome::Unchanged {
                    client: snapshot.client,
                    open_invoice,
                });
            }
            Err(e) => return Err(e),
        };

        store::save_enrollment(&mut *tx, &transition.enrollment).await?;
        let invoice = store::insert_invoice(&mut *tx, &transition.invoice)
            .await?
            .ok_or(BillingError::ConcurrentModification(client_id))?;

        tx.commit()
            .await
            .map_err(|e| BillingError::database("Failed to commit transaction", e))?;

        record_transition(&tenant, "first_invoice", "created");
        record_invoice_created(&tenant, "signup");
        info!(invoice_id = %invoice.invoice_id, amount = %invoice.amount, "First invoice created");

        dispatch(&self.notifier, &transition.events).await;

        Ok(FirstInvoiceOutcome::Created { invoice })
    }

    /// Mark a batch of invoices paid, one transaction per invoice. The token is checked
    /// between invoices; an invoice already started always finishes.
    #[instrument(skip(self, invoice_ids, cancel), fields(tenant_id = %tenant_id, count = invoice_ids.len()))]
    pub async fn reprocess_payments(
        &self,
        tenant_id: Uuid,
        invoice_ids: &[Uuid],
        paid_at: NaiveDate,
        cancel: &CancellationToken,
    ) -> ReprocessSummary {
        let mut summary = ReprocessSummary::default();

        for (position, invoice_id) in invoice_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = invoice_ids.len() - position;
                warn!(remaining = summary.cancelled, "Reprocessing cancelled");
                break;
            }

            summary.processed += 1;
            match self.mark_paid(tenant_id, *invoice_id, paid_at).await {
                Ok(MarkPaidOutcome::Paid { .. }) => summary.succeeded += 1,
                Ok(MarkPaidOutcome::AlreadySettled { .. }) => summary.skipped += 1,
                Ok(MarkPaidOutcome::InProgress { .. }) => summary.in_progress += 1,
                Err(e) => {
                    summary.failed += 1;
                    record_error(e.kind(), "reprocess_payments");
                    warn!(invoice_id = %invoice_id, error = %e, "Failed to reprocess invoice");
                }
            }
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            in_progress = summary.in_progress,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Reprocessing finished"
        );

        summary
    }
}
