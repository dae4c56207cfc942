//! Billing Invariants Module
//!
//! Read-only consistency checks over the ledger. Run them after a webhook
//! backlog, a manual data fix, or on a schedule; they never write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{BillingStatus, Invoice, InvoiceStatus};
use crate::store::LedgerStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Merchant(s) affected
    pub merchant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be collected twice or not at all
    Critical,
    /// Ledger records disagree with each other
    High,
    /// Needs a look, no money at risk yet
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const SINGLE_IN_FLIGHT_INVOICE: &str = "single_in_flight_invoice";
const TRANSACTION_BILLED_ONCE: &str = "transaction_billed_once";
const INVOICED_TRANSACTIONS_REFERENCE_PAID_INVOICE: &str =
    "invoiced_transactions_reference_paid_invoice";
const GRACE_FIELDS_MATCH_STATUS: &str = "grace_fields_match_status";
const STALE_PROCESSING_INVOICE: &str = "stale_processing_invoice";

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
    stale_processing_after: Duration,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>, stale_processing_after: Duration) -> Self {
        Self {
            store,
            stale_processing_after,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in Self::available_checks() {
            violations.extend(self.run_check(name, now).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        if !violations.is_empty() {
            tracing::warn!(
                violations = violations.len(),
                checks_failed,
                "Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(
        &self,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            SINGLE_IN_FLIGHT_INVOICE => {
                Ok(check_single_in_flight_invoice(&self.store.all_invoices().await?))
            }
            TRANSACTION_BILLED_ONCE => {
                Ok(check_transaction_billed_once(&self.store.all_invoices().await?))
            }
            INVOICED_TRANSACTIONS_REFERENCE_PAID_INVOICE => {
                self.check_invoiced_transactions_reference_paid_invoice().await
            }
            GRACE_FIELDS_MATCH_STATUS => self.check_grace_fields_match_status().await,
            STALE_PROCESSING_INVOICE => self.check_stale_processing_invoice(now).await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            SINGLE_IN_FLIGHT_INVOICE,
            TRANSACTION_BILLED_ONCE,
            INVOICED_TRANSACTIONS_REFERENCE_PAID_INVOICE,
            GRACE_FIELDS_MATCH_STATUS,
            STALE_PROCESSING_INVOICE,
        ]
    }

    /// Every `invoiced` transaction points at a paid invoice that lists it.
    async fn check_invoiced_transactions_reference_paid_invoice(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let invoices: HashMap<Uuid, Invoice> = self
            .store
            .all_invoices()
            .await?
            .into_iter()
            .map(|i| (i.id, i))
            .collect();

        Ok(self
            .store
            .invoiced_transactions()
            .await?
            .into_iter()
            .filter_map(|tx| {
                let invoice = tx.invoice_id.and_then(|id| invoices.get(&id));
                let consistent = invoice.is_some_and(|i| {
                    i.status == InvoiceStatus::Paid && i.transaction_ids.contains(&tx.id)
                });
                (!consistent).then(|| InvariantViolation {
                    invariant: INVOICED_TRANSACTIONS_REFERENCE_PAID_INVOICE.to_string(),
                    merchant_ids: vec![tx.merchant_id],
                    description: format!(
                        "Transaction {} is invoiced without a paid invoice covering it",
                        tx.id
                    ),
                    context: serde_json::json!({
                        "transaction_id": tx.id,
                        "invoice_id": tx.invoice_id,
                        "invoice_status": invoice.map(|i| i.status.as_str()),
                    }),
                    severity: ViolationSeverity::High,
                })
            })
            .collect())
    }

    async fn check_grace_fields_match_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .all_merchants()
            .await?
            .into_iter()
            .filter_map(|m| {
                let fields = [
                    m.payment_failed_at.is_some(),
                    m.grace_period_ends_at.is_some(),
                    m.last_failed_invoice_id.is_some(),
                ];
                let consistent = match m.billing_status {
                    BillingStatus::Active => fields.iter().all(|set| !set),
                    BillingStatus::GracePeriod => fields.iter().all(|set| *set),
                    BillingStatus::UnpaidLockout => true,
                };
                (!consistent).then(|| InvariantViolation {
                    invariant: GRACE_FIELDS_MATCH_STATUS.to_string(),
                    merchant_ids: vec![m.id],
                    description: format!(
                        "Merchant in {} has inconsistent grace-period fields",
                        m.billing_status
                    ),
                    context: serde_json::json!({
                        "billing_status": m.billing_status.as_str(),
                        "payment_failed_at": m.payment_failed_at.map(|t| t.unix_timestamp()),
                        "grace_period_ends_at": m.grace_period_ends_at.map(|t| t.unix_timestamp()),
                        "last_failed_invoice_id": m.last_failed_invoice_id,
                    }),
                    severity: ViolationSeverity::Medium,
                })
            })
            .collect())
    }

    /// Processing invoices whose webhook never arrived. Reported, never resolved.
    async fn check_stale_processing_invoice(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let cutoff = now - self.stale_processing_after;
        Ok(self
            .store
            .invoices_in_status_before(InvoiceStatus::Processing, cutoff)
            .await?
            .into_iter()
            .map(|i| InvariantViolation {
                invariant: STALE_PROCESSING_INVOICE.to_string(),
                merchant_ids: vec![i.merchant_id],
                description: format!(
                    "Invoice {} has been processing for {} hours",
                    i.id,
                    (now - i.updated_at).whole_hours()
                ),
                context: serde_json::json!({
                    "invoice_id": i.id,
                    "kind": i.kind.as_str(),
                    "external_payment_id": i.external_payment_id,
                    "total_fee_cents": i.total_fee_cents,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

fn check_single_in_flight_invoice(invoices: &[Invoice]) -> Vec<InvariantViolation> {
    let mut in_flight: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for invoice in invoices.iter().filter(|i| !i.status.is_terminal()) {
        in_flight.entry(invoice.merchant_id).or_default().push(invoice.id);
    }

    in_flight
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(merchant_id, ids)| InvariantViolation {
            invariant: SINGLE_IN_FLIGHT_INVOICE.to_string(),
            merchant_ids: vec![merchant_id],
            description: format!(
                "Merchant has {} invoices awaiting payment (expected at most 1)",
                ids.len()
            ),
            context: serde_json::json!({ "invoice_ids": ids }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

/// A transaction may sit in one paid invoice, and in one live invoice only
/// while it has not been paid for.
fn check_transaction_billed_once(invoices: &[Invoice]) -> Vec<InvariantViolation> {
    let mut claims: HashMap<Uuid, Vec<&Invoice>> = HashMap::new();
    for invoice in invoices.iter().filter(|i| i.status != InvoiceStatus::Failed) {
        for tx_id in &invoice.transaction_ids {
            claims.entry(*tx_id).or_default().push(invoice);
        }
    }

    claims
        .into_iter()
        .filter(|(_, invoices)| invoices.len() > 1)
        .map(|(tx_id, invoices)| InvariantViolation {
            invariant: TRANSACTION_BILLED_ONCE.to_string(),
            merchant_ids: invoices
                .iter()
                .map(|i| i.merchant_id)
                .collect::<HashSet<_>>()
                .into_iter()
                .collect(),
            description: format!(
                "Transaction {} is covered by {} paid or live invoices",
                tx_id,
                invoices.len()
            ),
            context: serde_json::json!({
                "transaction_id": tx_id,
                "invoices": invoices
                    .iter()
                    .map(|i| serde_json::json!({ "id": i.id, "status": i.status.as_str() }))
                    .collect::<Vec<_>>(),
            }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::InvoiceKind;

    fn invoice(merchant_id: Uuid, status: InvoiceStatus, txs: Vec<Uuid>) -> Invoice {
        let now = OffsetDateTime::now_utc();
        Invoice {
            id: Uuid::new_v4(),
            merchant_id,
            kind: InvoiceKind::Scheduled,
            period_start: now,
            period_end: now,
            total_sales_cents: 0,
            total_fee_cents: 0,
            transaction_count: txs.len() as i32,
            transaction_ids: txs,
            status,
            external_payment_id: None,
            checkout_url: None,
            failure_reason: None,
            paid_at: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_in_flight_invoice"));
        assert!(checks.contains(&"stale_processing_invoice"));
    }

    #[test]
    fn two_live_invoices_for_one_merchant_is_critical() {
        let merchant = Uuid::new_v4();
        let invoices = vec![
            invoice(merchant, InvoiceStatus::Pending, vec![]),
            invoice(merchant, InvoiceStatus::Processing, vec![]),
            invoice(Uuid::new_v4(), InvoiceStatus::Processing, vec![]),
        ];
        let violations = check_single_in_flight_invoice(&invoices);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].merchant_ids, vec![merchant]);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn failed_invoices_release_their_transactions() {
        let merchant = Uuid::new_v4();
        let tx = Uuid::new_v4();

        let reinvoiced = vec![
            invoice(merchant, InvoiceStatus::Failed, vec![tx]),
            invoice(merchant, InvoiceStatus::Paid, vec![tx]),
        ];
        assert!(check_transaction_billed_once(&reinvoiced).is_empty());

        let double_paid = vec![
            invoice(merchant, InvoiceStatus::Paid, vec![tx]),
            invoice(merchant, InvoiceStatus::Paid, vec![tx]),
        ];
        assert_eq!(check_transaction_billed_once(&double_paid).len(), 1);
    }
}
