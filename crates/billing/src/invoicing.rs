//! Invoice creation and charge initiation shared by the scheduler and manual retry

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::{ChargeRequest, PaymentProvider};
use crate::error::BillingResult;
use crate::models::{InvoiceKind, Merchant, NewInvoice, PendingTotals};
use crate::policy::BillingPolicy;
use crate::store::{FailureEffect, LedgerStore};

/// Failure reason recorded on a pay-now invoice replaced by a newer charge
pub(crate) const SUPERSEDED_REASON: &str = "superseded";

/// Result of asking the provider to charge a saved payment method
#[derive(Debug, Clone)]
pub enum ChargeAttempt {
    /// Provider accepted the charge; the invoice waits for a webhook
    Initiated { invoice_id: Uuid, payment_id: String },
    /// Provider rejected the request; the invoice is already `failed`
    Rejected {
        invoice_id: Uuid,
        reason: String,
        entered_grace: bool,
    },
}

pub(crate) fn fee_description(totals: &PendingTotals) -> String {
    format!(
        "Platform fees: {} on {} in sales ({} transactions)",
        stacker_shared::format_cents(totals.total_fee_cents),
        stacker_shared::format_cents(totals.total_sales_cents),
        totals.transaction_count
    )
}

pub(crate) fn new_invoice(
    merchant: &Merchant,
    kind: InvoiceKind,
    totals: &PendingTotals,
    now: OffsetDateTime,
) -> NewInvoice {
    NewInvoice {
        merchant_id: merchant.id,
        kind,
        period_start: merchant.billing_cycle_start,
        period_end: now,
        total_sales_cents: totals.total_sales_cents,
        total_fee_cents: totals.total_fee_cents,
        transaction_ids: totals.transaction_ids.clone(),
        created_at: now,
    }
}

#[derive(Clone)]
pub(crate) struct Invoicing {
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn PaymentProvider>,
    grace_period: Duration,
    checkout_ttl: Duration,
    currency: String,
}

impl Invoicing {
    pub(crate) fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn PaymentProvider>,
        policy: &BillingPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            grace_period: policy.grace_period,
            checkout_ttl: policy.pay_now_checkout_ttl,
            currency: policy.currency.clone(),
        }
    }

    /// Fail the merchant's pay-now invoice once its checkout has been open
    /// longer than the checkout TTL, releasing its transactions.
    ///
    /// The billing status is left alone. Returns the superseded invoice id.
    pub(crate) async fn supersede_abandoned_checkout(
        &self,
        merchant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Uuid>> {
        let cutoff = now - self.checkout_ttl;
        let abandoned = self
            .store
            .recent_invoices(merchant_id, 10)
            .await?
            .into_iter()
            .find(|i| {
                i.kind == InvoiceKind::PayNow && !i.status.is_terminal() && i.created_at <= cutoff
            });
        let Some(invoice) = abandoned else {
            return Ok(None);
        };

        match self
            .store
            .mark_invoice_failed(invoice.id, SUPERSEDED_REASON, FailureEffect::KeepStatus, now)
            .await?
        {
            Some(_) => {
                tracing::info!(
                    merchant_id = %merchant_id,
                    invoice_id = %invoice.id,
                    opened_at = %invoice.created_at,
                    "Abandoned pay-now checkout superseded"
                );
                Ok(Some(invoice.id))
            }
            None => Ok(None),
        }
    }

    /// Invoice `totals` and charge the merchant's saved payment method.
    ///
    /// The invoice is created `pending` over the exact transaction snapshot and
    /// moved to `processing` before the provider call, so a webhook racing the
    /// response can already settle it through the invoice id in the metadata.
    pub(crate) async fn charge_saved_method(
        &self,
        merchant: &Merchant,
        payment_method_id: &str,
        kind: InvoiceKind,
        totals: &PendingTotals,
        now: OffsetDateTime,
    ) -> BillingResult<ChargeAttempt> {
        self.supersede_abandoned_checkout(merchant.id, now).await?;
        let invoice = self
            .store
            .create_invoice(new_invoice(merchant, kind, totals, now))
            .await?;
        self.store
            .mark_invoice_processing(invoice.id, None, None, now)
            .await?;

        let request = ChargeRequest {
            merchant_id: merchant.id,
            invoice_id: invoice.id,
            member_id: merchant.external_user_id.clone(),
            payment_method_id: payment_method_id.to_string(),
            amount_cents: totals.total_fee_cents,
            currency: self.currency.clone(),
            description: fee_description(totals),
        };

        match self.provider.charge_saved_method(&request).await {
            Ok(receipt) => {
                self.store
                    .mark_invoice_processing(invoice.id, Some(&receipt.payment_id), None, now)
                    .await?;
                tracing::info!(
                    merchant_id = %merchant.id,
                    invoice_id = %invoice.id,
                    payment_id = %receipt.payment_id,
                    kind = kind.as_str(),
                    total_fee_cents = totals.total_fee_cents,
                    transaction_count = totals.transaction_count,
                    "Charge initiated"
                );
                Ok(ChargeAttempt::Initiated {
                    invoice_id: invoice.id,
                    payment_id: receipt.payment_id,
                })
            }
            Err(e) => {
                let reason = e.message();
                tracing::error!(
                    merchant_id = %merchant.id,
                    invoice_id = %invoice.id,
                    error = %reason,
                    "Charge initiation failed"
                );
                let entered_grace = self.fail_invoice(invoice.id, merchant.id, &reason, now).await?;
                Ok(ChargeAttempt::Rejected {
                    invoice_id: invoice.id,
                    reason,
                    entered_grace,
                })
            }
        }
    }

    /// Fail an invoice and, in the same step, move an `active` merchant into grace.
    ///
    /// Returns whether the merchant entered the grace period.
    pub(crate) async fn fail_invoice(
        &self,
        invoice_id: Uuid,
        merchant_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let effect = FailureEffect::EnterGrace(self.grace_period);
        match self.store.mark_invoice_failed(invoice_id, reason, effect, now).await? {
            Some(settled) => {
                if settled.status_changed {
                    tracing::warn!(
                        merchant_id = %merchant_id,
                        invoice_id = %invoice_id,
                        "Merchant entered grace period"
                    );
                }
                Ok(settled.status_changed)
            }
            None => {
                // Already settled by a webhook, which ran its own transition
                tracing::warn!(
                    invoice_id = %invoice_id,
                    "Invoice was terminal before it could be failed"
                );
                Ok(false)
            }
        }
    }
}
