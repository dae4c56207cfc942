//! Billing Cycle Scheduler
//!
//! One sweep per cron trigger: lock out merchants whose grace expired, then
//! invoice and charge every merchant whose billing date has arrived.
//! Merchants are processed one at a time and a failure for one merchant is
//! recorded in the report without stopping the sweep.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PaymentProvider;
use crate::error::{BillingError, BillingResult};
use crate::invoicing::{ChargeAttempt, Invoicing};
use crate::models::{BillingStatus, InvoiceKind, Merchant, PendingTotals};
use crate::policy::BillingPolicy;
use crate::status::BillingStateMachine;
use crate::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    #[serde(rename = "no pending transactions")]
    NoPendingTransactions,
    #[serde(rename = "below minimum")]
    BelowMinimum,
    #[serde(rename = "no payment method")]
    NoPaymentMethod,
    #[serde(rename = "invoice already in flight")]
    InvoiceInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Processed {
        invoice_id: Uuid,
        payment_id: String,
        total_fee_cents: i64,
        transaction_count: usize,
    },
    Skipped {
        reason: SkipReason,
        total_fee_cents: i64,
    },
    Failed {
        invoice_id: Option<Uuid>,
        error: String,
        /// Whether this failure moved the merchant into the grace period
        entered_grace: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MerchantCycleOutcome {
    pub merchant_id: Uuid,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BillingCycleReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Merchants moved from grace period to lockout by this sweep
    pub locked_out: usize,
    pub details: Vec<MerchantCycleOutcome>,
}

impl BillingCycleReport {
    fn push(&mut self, merchant_id: Uuid, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Processed { .. } => self.processed += 1,
            CycleOutcome::Skipped { .. } => self.skipped += 1,
            CycleOutcome::Failed { .. } => self.failed += 1,
        }
        self.details.push(MerchantCycleOutcome {
            merchant_id,
            outcome,
        });
    }
}

pub struct BillingCycle {
    store: Arc<dyn LedgerStore>,
    invoicing: Invoicing,
    state_machine: BillingStateMachine,
    policy: BillingPolicy,
}

impl BillingCycle {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn PaymentProvider>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            invoicing: Invoicing::new(store.clone(), provider, &policy),
            state_machine: BillingStateMachine::new(store.clone()),
            store,
            policy,
        }
    }

    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<BillingCycleReport> {
        let mut report = BillingCycleReport {
            locked_out: self.sweep_expired_grace(now).await?,
            ..Default::default()
        };

        let due = self.store.merchants_due_for_billing(now).await?;
        tracing::info!(due = due.len(), "Starting billing cycle");

        for merchant in due {
            let merchant_id = merchant.id;
            let outcome = match self.bill_merchant(&merchant, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        merchant_id = %merchant_id,
                        error = %e,
                        "Billing cycle failed for merchant"
                    );
                    CycleOutcome::Failed {
                        invoice_id: None,
                        error: e.to_string(),
                        entered_grace: false,
                    }
                }
            };
            report.push(merchant_id, outcome);
        }

        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            locked_out = report.locked_out,
            "Billing cycle complete"
        );
        Ok(report)
    }

    /// Lock out every merchant whose grace period has ended; returns how many moved.
    pub async fn sweep_expired_grace(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let mut locked_out = 0;
        for merchant in self.store.merchants_with_expired_grace(now).await? {
            let merchant_id = merchant.id;
            match self.state_machine.evaluate(merchant, now).await {
                Ok(m) if m.billing_status == BillingStatus::UnpaidLockout => locked_out += 1,
                Ok(_) => {}
                Err(e) => tracing::error!(
                    merchant_id = %merchant_id,
                    error = %e,
                    "Failed to evaluate expired grace period"
                ),
            }
        }
        Ok(locked_out)
    }

    async fn bill_merchant(
        &self,
        merchant: &Merchant,
        now: OffsetDateTime,
    ) -> BillingResult<CycleOutcome> {
        let pending = self.store.pending_transactions(merchant.id).await?;
        if pending.is_empty() {
            self.store
                .advance_billing_cycle(merchant.id, now, now + self.policy.billing_interval)
                .await?;
            tracing::debug!(merchant_id = %merchant.id, "No pending transactions, cycle advanced");
            return Ok(CycleOutcome::Skipped {
                reason: SkipReason::NoPendingTransactions,
                total_fee_cents: 0,
            });
        }

        let totals = PendingTotals::from_transactions(&pending);

        // Below-minimum balances roll into the next cycle with the date untouched
        if totals.total_fee_cents < self.policy.minimum_charge_cents {
            tracing::debug!(
                merchant_id = %merchant.id,
                total_fee_cents = totals.total_fee_cents,
                "Pending fees below minimum, rolling over"
            );
            return Ok(CycleOutcome::Skipped {
                reason: SkipReason::BelowMinimum,
                total_fee_cents: totals.total_fee_cents,
            });
        }

        let Some(payment_method_id) = merchant.payment_method_id.as_deref() else {
            tracing::warn!(merchant_id = %merchant.id, "Merchant due for billing has no payment method");
            return Ok(CycleOutcome::Skipped {
                reason: SkipReason::NoPaymentMethod,
                total_fee_cents: totals.total_fee_cents,
            });
        };

        let attempt = match self
            .invoicing
            .charge_saved_method(merchant, payment_method_id, InvoiceKind::Scheduled, &totals, now)
            .await
        {
            Ok(attempt) => attempt,
            Err(BillingError::InvoiceInFlight(_)) => {
                return Ok(CycleOutcome::Skipped {
                    reason: SkipReason::InvoiceInFlight,
                    total_fee_cents: totals.total_fee_cents,
                });
            }
            Err(e) => return Err(e),
        };

        Ok(match attempt {
            ChargeAttempt::Initiated {
                invoice_id,
                payment_id,
            } => CycleOutcome::Processed {
                invoice_id,
                payment_id,
                total_fee_cents: totals.total_fee_cents,
                transaction_count: totals.transaction_count,
            },
            ChargeAttempt::Rejected {
                invoice_id,
                reason,
                entered_grace,
            } => CycleOutcome::Failed {
                invoice_id: Some(invoice_id),
                error: reason,
                entered_grace,
            },
        })
    }
}
