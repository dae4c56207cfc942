//! Payment Reconciliation
//!
//! Routes asynchronous provider outcomes. A payment collected by the platform's
//! own billing company settles one of our invoices (Branch A); a payment
//! collected by a registered merchant is a sale that accrues a fee (Branch B).

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PaymentProvider;
use crate::error::{BillingError, BillingResult};
use crate::fees::{FeeAccrual, RecordSale, SaleOutcome};
use crate::models::{Invoice, InvoiceStatus};
use crate::policy::BillingPolicy;
use crate::store::{FailureEffect, LedgerStore};
use crate::webhooks::{PaymentFailed, PaymentSucceeded};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    InvoicePaid {
        invoice_id: Uuid,
        merchant_id: Uuid,
        reactivated: bool,
    },
    InvoiceFailed {
        invoice_id: Uuid,
        merchant_id: Uuid,
        entered_grace: bool,
    },
    SaleRecorded {
        transaction_id: Uuid,
        merchant_id: Uuid,
        fee_amount_cents: i64,
    },
    DuplicateSale {
        transaction_id: Uuid,
    },
    PaymentMethodSaved {
        merchant_id: Uuid,
    },
    Ignored {
        reason: String,
    },
}

impl ReconcileOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        ReconcileOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn PaymentProvider>,
    fees: FeeAccrual,
    policy: BillingPolicy,
    billing_company_id: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn PaymentProvider>,
        policy: BillingPolicy,
        billing_company_id: impl Into<String>,
    ) -> Self {
        Self {
            fees: FeeAccrual::new(store.clone(), policy.clone()),
            store,
            provider,
            policy,
            billing_company_id: billing_company_id.into(),
        }
    }

    fn is_platform_payment(&self, company_id: &str) -> bool {
        company_id == self.billing_company_id
    }

    /// Find the invoice a platform payment belongs to.
    ///
    /// The payment id is stored only after the provider answers, so a webhook
    /// that wins that race is matched through the invoice id in its metadata.
    /// Pay-now checkouts always take the metadata path.
    async fn find_invoice(
        &self,
        payment_id: &str,
        invoice_id: Option<Uuid>,
    ) -> BillingResult<Option<Invoice>> {
        if let Some(invoice) = self.store.find_invoice_by_payment_id(payment_id).await? {
            return Ok(Some(invoice));
        }
        match invoice_id {
            Some(id) => self.store.get_invoice(id).await,
            None => Ok(None),
        }
    }

    pub async fn on_payment_succeeded(
        &self,
        payment: &PaymentSucceeded,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        if self.is_platform_payment(&payment.company_id) {
            self.settle_invoice(payment, now).await
        } else {
            self.record_merchant_sale(payment, now).await
        }
    }

    async fn settle_invoice(
        &self,
        payment: &PaymentSucceeded,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(invoice) = self.find_invoice(&payment.payment_id, payment.invoice_id).await? else {
            tracing::warn!(
                payment_id = %payment.payment_id,
                "Platform payment does not match any invoice"
            );
            return Ok(ReconcileOutcome::ignored("no matching invoice"));
        };

        // Invoice, transactions, cycle dates and billing status move together
        let Some(settled) = self
            .store
            .mark_invoice_paid(invoice.id, now, now + self.policy.billing_interval)
            .await?
        else {
            if invoice.status == InvoiceStatus::Failed {
                // Money arrived for an invoice we already gave up on
                tracing::warn!(
                    invoice_id = %invoice.id,
                    payment_id = %payment.payment_id,
                    failure_reason = ?invoice.failure_reason,
                    "Payment for a failed invoice needs manual review"
                );
            } else {
                tracing::info!(
                    invoice_id = %invoice.id,
                    status = %invoice.status,
                    "Invoice not processing, ignoring payment"
                );
            }
            return Ok(ReconcileOutcome::ignored(format!(
                "invoice is {}",
                invoice.status
            )));
        };

        let paid = settled.invoice;
        let reactivated = settled.status_changed;

        if paid.total_fee_cents != payment.amount_cents {
            tracing::warn!(
                invoice_id = %paid.id,
                invoiced_cents = paid.total_fee_cents,
                paid_cents = payment.amount_cents,
                "Collected amount differs from invoice total"
            );
        }

        tracing::info!(
            merchant_id = %paid.merchant_id,
            invoice_id = %paid.id,
            payment_id = %payment.payment_id,
            total_fee_cents = paid.total_fee_cents,
            transaction_count = paid.transaction_count,
            reactivated,
            "Invoice paid"
        );

        Ok(ReconcileOutcome::InvoicePaid {
            invoice_id: paid.id,
            merchant_id: paid.merchant_id,
            reactivated,
        })
    }

    async fn record_merchant_sale(
        &self,
        payment: &PaymentSucceeded,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(merchant) = self.store.find_merchant_by_company(&payment.company_id).await? else {
            tracing::debug!(
                company_id = %payment.company_id,
                payment_id = %payment.payment_id,
                "Sale for unregistered company"
            );
            return Ok(ReconcileOutcome::ignored("company not registered"));
        };

        // Only our own fee charges may omit the product
        let Some(product_id) = payment.product_id.clone() else {
            return Err(BillingError::WebhookPayload(
                "merchant sale without product".to_string(),
            ));
        };
        let product_name = match &payment.product_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.lookup_product_name(&product_id).await,
        };

        let outcome = self
            .fees
            .record_sale(RecordSale {
                merchant_id: merchant.id,
                external_payment_id: payment.payment_id.clone(),
                product_id,
                product_name,
                sale_amount_cents: payment.amount_cents,
                currency: payment.currency.clone(),
                occurred_at: now,
            })
            .await?;

        Ok(match outcome {
            SaleOutcome::Recorded(tx) => ReconcileOutcome::SaleRecorded {
                transaction_id: tx.id,
                merchant_id: tx.merchant_id,
                fee_amount_cents: tx.fee_amount_cents,
            },
            SaleOutcome::Duplicate(tx) => ReconcileOutcome::DuplicateSale {
                transaction_id: tx.id,
            },
        })
    }

    async fn lookup_product_name(&self, product_id: &str) -> String {
        match self.provider.product_info(product_id).await {
            Ok(product) => product.name,
            Err(e) => {
                tracing::debug!(product_id, error = %e, "Product lookup failed, using id");
                product_id.to_string()
            }
        }
    }

    /// A platform fee charge failed after it was accepted.
    ///
    /// Applies the same grace-period transition as a synchronous charge
    /// failure, in the same store step as the invoice write.
    pub async fn on_payment_failed(
        &self,
        payment: &PaymentFailed,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        if !self.is_platform_payment(&payment.company_id) {
            return Ok(ReconcileOutcome::ignored("merchant sale failure"));
        }

        let Some(invoice) = self.find_invoice(&payment.payment_id, payment.invoice_id).await? else {
            tracing::warn!(
                payment_id = %payment.payment_id,
                "Failed platform payment does not match any invoice"
            );
            return Ok(ReconcileOutcome::ignored("no matching invoice"));
        };

        let Some(settled) = self
            .store
            .mark_invoice_failed(
                invoice.id,
                &payment.failure_reason,
                FailureEffect::EnterGrace(self.policy.grace_period),
                now,
            )
            .await?
        else {
            return Ok(ReconcileOutcome::ignored(format!(
                "invoice is {}",
                invoice.status
            )));
        };

        let failed = settled.invoice;
        let entered_grace = settled.status_changed;

        tracing::warn!(
            merchant_id = %failed.merchant_id,
            invoice_id = %failed.id,
            reason = %payment.failure_reason,
            entered_grace,
            "Invoice payment failed"
        );

        Ok(ReconcileOutcome::InvoiceFailed {
            invoice_id: failed.id,
            merchant_id: failed.merchant_id,
            entered_grace,
        })
    }

    pub async fn on_payment_method_vaulted(
        &self,
        merchant_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<ReconcileOutcome> {
        if payment_method_id.trim().is_empty() {
            return Err(BillingError::Validation(
                "payment method id is required".to_string(),
            ));
        }
        if !self
            .store
            .set_payment_method(merchant_id, payment_method_id)
            .await?
        {
            return Err(BillingError::NotFound(format!("Merchant {}", merchant_id)));
        }

        tracing::info!(merchant_id = %merchant_id, "Payment method saved");
        Ok(ReconcileOutcome::PaymentMethodSaved { merchant_id })
    }
}
