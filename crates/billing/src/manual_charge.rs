//! Manual Retry / Pay-Now
//!
//! Merchant-initiated billing outside the weekly cycle: retry the saved
//! payment method, or pay the pending balance through a one-time checkout.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{CheckoutRequest, PaymentProvider};
use crate::error::{BillingError, BillingResult};
use crate::invoicing::{fee_description, new_invoice, ChargeAttempt, Invoicing};
use crate::models::{BillingStatus, Invoice, InvoiceKind, Merchant, PendingTotals};
use crate::policy::BillingPolicy;
use crate::store::{FailureEffect, LedgerStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// No pending transactions; nothing was invoiced and the status is unchanged
    NothingToBill { total_fee_cents: i64 },
    /// Charge accepted; the result arrives by webhook
    ChargeInitiated {
        invoice_id: Uuid,
        payment_id: String,
        total_fee_cents: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PayNowOutcome {
    CheckoutCreated {
        invoice_id: Uuid,
        checkout_id: String,
        checkout_url: String,
        total_fee_cents: i64,
        transaction_count: usize,
    },
    /// A pay-now checkout for this merchant is still open
    CheckoutPending {
        invoice_id: Uuid,
        checkout_url: String,
        total_fee_cents: i64,
    },
}

pub struct ManualCharge {
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn PaymentProvider>,
    invoicing: Invoicing,
    policy: BillingPolicy,
    redirect_url: Option<String>,
}

impl ManualCharge {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn PaymentProvider>,
        policy: BillingPolicy,
        redirect_url: Option<String>,
    ) -> Self {
        Self {
            invoicing: Invoicing::new(store.clone(), provider.clone(), &policy),
            store,
            provider,
            policy,
            redirect_url,
        }
    }

    async fn load(&self, merchant_id: Uuid) -> BillingResult<Merchant> {
        self.store
            .get_merchant(merchant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Merchant {}", merchant_id)))
    }

    /// Charge the saved payment method for everything pending.
    ///
    /// A failed retry never moves the merchant: they are already past `active`.
    pub async fn retry_payment(
        &self,
        merchant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<RetryOutcome> {
        let merchant = self.load(merchant_id).await?;

        if merchant.billing_status == BillingStatus::Active {
            return Err(BillingError::Validation("no retry needed".to_string()));
        }
        let Some(payment_method_id) = merchant.payment_method_id.clone() else {
            return Err(BillingError::NoPaymentMethod);
        };

        let pending = self.store.pending_transactions(merchant.id).await?;
        if pending.is_empty() {
            tracing::info!(merchant_id = %merchant.id, "Retry requested with nothing pending");
            return Ok(RetryOutcome::NothingToBill { total_fee_cents: 0 });
        }
        let totals = PendingTotals::from_transactions(&pending);

        match self
            .invoicing
            .charge_saved_method(&merchant, &payment_method_id, InvoiceKind::Retry, &totals, now)
            .await?
        {
            ChargeAttempt::Initiated {
                invoice_id,
                payment_id,
            } => Ok(RetryOutcome::ChargeInitiated {
                invoice_id,
                payment_id,
                total_fee_cents: totals.total_fee_cents,
            }),
            ChargeAttempt::Rejected { reason, .. } => Err(BillingError::PaymentProvider(reason)),
        }
    }

    async fn open_pay_now_invoice(&self, merchant_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self
            .store
            .recent_invoices(merchant_id, 10)
            .await?
            .into_iter()
            .find(|i| i.kind == InvoiceKind::PayNow && !i.status.is_terminal() && i.checkout_url.is_some()))
    }

    /// Open a one-time checkout for the pending balance.
    pub async fn pay_now(
        &self,
        merchant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<PayNowOutcome> {
        let merchant = self.load(merchant_id).await?;

        let pending = self.store.pending_transactions(merchant.id).await?;
        if pending.is_empty() {
            return Err(BillingError::Validation("no pending transactions".to_string()));
        }
        let totals = PendingTotals::from_transactions(&pending);
        if totals.total_fee_cents < self.policy.pay_now_minimum_cents {
            return Err(BillingError::BelowMinimum {
                total_fee_cents: totals.total_fee_cents,
                minimum_cents: self.policy.pay_now_minimum_cents,
            });
        }

        self.invoicing
            .supersede_abandoned_checkout(merchant.id, now)
            .await?;
        let invoice = match self
            .store
            .create_invoice(new_invoice(&merchant, InvoiceKind::PayNow, &totals, now))
            .await
        {
            Ok(invoice) => invoice,
            Err(BillingError::InvoiceInFlight(id)) => {
                // Hand back the checkout the merchant already opened
                return match self.open_pay_now_invoice(merchant.id).await? {
                    Some(Invoice {
                        id,
                        checkout_url: Some(checkout_url),
                        total_fee_cents,
                        ..
                    }) => Ok(PayNowOutcome::CheckoutPending {
                        invoice_id: id,
                        checkout_url,
                        total_fee_cents,
                    }),
                    _ => Err(BillingError::InvoiceInFlight(id)),
                };
            }
            Err(e) => return Err(e),
        };

        let request = CheckoutRequest {
            merchant_id: merchant.id,
            invoice_id: invoice.id,
            amount_cents: totals.total_fee_cents,
            currency: self.policy.currency.clone(),
            description: fee_description(&totals),
            redirect_url: self.redirect_url.clone(),
        };

        let session = match self.provider.create_checkout(&request).await {
            Ok(session) => session,
            Err(e) => {
                // No charge was attempted: fail the invoice so the balance is
                // billable again, without touching the billing status
                let reason = e.message();
                tracing::error!(
                    merchant_id = %merchant.id,
                    invoice_id = %invoice.id,
                    error = %e,
                    "Pay-now checkout creation failed"
                );
                self.store
                    .mark_invoice_failed(invoice.id, &reason, FailureEffect::KeepStatus, now)
                    .await?;
                return Err(BillingError::PaymentProvider(reason));
            }
        };

        self.store
            .mark_invoice_processing(invoice.id, Some(&session.id), Some(&session.url), now)
            .await?;

        tracing::info!(
            merchant_id = %merchant.id,
            invoice_id = %invoice.id,
            checkout_id = %session.id,
            total_fee_cents = totals.total_fee_cents,
            "Pay-now checkout created"
        );

        Ok(PayNowOutcome::CheckoutCreated {
            invoice_id: invoice.id,
            checkout_id: session.id,
            checkout_url: session.url,
            total_fee_cents: totals.total_fee_cents,
            transaction_count: totals.transaction_count,
        })
    }
}
