//! Ledger records: merchants, fee transactions and invoices

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// A merchant's billing standing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Active,
    GracePeriod,
    UnpaidLockout,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Active => "active",
            BillingStatus::GracePeriod => "grace_period",
            BillingStatus::UnpaidLockout => "unpaid_lockout",
        }
    }

    /// Edges of the billing state machine.
    ///
    /// `Active` can only fall into `GracePeriod`; lockout is only reachable from
    /// the grace period; recovery always lands on `Active`.
    pub fn can_transition_to(&self, next: BillingStatus) -> bool {
        matches!(
            (self, next),
            (BillingStatus::Active, BillingStatus::GracePeriod)
                | (BillingStatus::GracePeriod, BillingStatus::UnpaidLockout)
                | (BillingStatus::GracePeriod, BillingStatus::Active)
                | (BillingStatus::UnpaidLockout, BillingStatus::Active)
        )
    }
}

impl fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BillingStatus::Active),
            "grace_period" => Ok(BillingStatus::GracePeriod),
            "unpaid_lockout" => Ok(BillingStatus::UnpaidLockout),
            other => Err(BillingError::Internal(format!(
                "Unknown billing status: {}",
                other
            ))),
        }
    }
}

/// Billing status together with the grace-period bookkeeping that travels with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingState {
    pub status: BillingStatus,
    pub payment_failed_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub last_failed_invoice_id: Option<Uuid>,
}

impl BillingState {
    pub fn active() -> Self {
        Self {
            status: BillingStatus::Active,
            payment_failed_at: None,
            grace_period_ends_at: None,
            last_failed_invoice_id: None,
        }
    }
}

/// A community owner whose sales are fee-metered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: Uuid,
    pub external_user_id: String,
    pub external_company_id: String,
    pub billing_status: BillingStatus,
    pub payment_method_id: Option<String>,
    pub payment_method_connected: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub billing_cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub payment_failed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub last_failed_invoice_id: Option<Uuid>,
    pub total_revenue_generated_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Merchant {
    pub fn billing_state(&self) -> BillingState {
        BillingState {
            status: self.billing_status,
            payment_failed_at: self.payment_failed_at,
            grace_period_ends_at: self.grace_period_ends_at,
            last_failed_invoice_id: self.last_failed_invoice_id,
        }
    }

    pub fn apply_billing_state(&mut self, state: BillingState) {
        self.billing_status = state.status;
        self.payment_failed_at = state.payment_failed_at;
        self.grace_period_ends_at = state.grace_period_ends_at;
        self.last_failed_invoice_id = state.last_failed_invoice_id;
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.next_billing_date <= now
    }
}

/// Input for registering a merchant on first platform interaction
#[derive(Debug, Clone)]
pub struct NewMerchant {
    pub external_user_id: String,
    pub external_company_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Invoiced,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Invoiced => "invoiced",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "invoiced" => Ok(TransactionStatus::Invoiced),
            other => Err(BillingError::Internal(format!(
                "Unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// One fee-bearing sale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub external_payment_id: String,
    pub product_id: String,
    pub product_name: String,
    pub sale_amount_cents: i64,
    pub fee_amount_cents: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub invoice_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub merchant_id: Uuid,
    pub external_payment_id: String,
    pub product_id: String,
    pub product_name: String,
    pub sale_amount_cents: i64,
    pub fee_amount_cents: i64,
    pub currency: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Failed)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvoiceStatus::Pending),
            "processing" => Ok(InvoiceStatus::Processing),
            "paid" => Ok(InvoiceStatus::Paid),
            "failed" => Ok(InvoiceStatus::Failed),
            other => Err(BillingError::Internal(format!(
                "Unknown invoice status: {}",
                other
            ))),
        }
    }
}

/// Which entry point produced an invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Scheduled,
    Retry,
    PayNow,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Scheduled => "scheduled",
            InvoiceKind::Retry => "retry",
            InvoiceKind::PayNow => "pay_now",
        }
    }
}

impl FromStr for InvoiceKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(InvoiceKind::Scheduled),
            "retry" => Ok(InvoiceKind::Retry),
            "pay_now" => Ok(InvoiceKind::PayNow),
            other => Err(BillingError::Internal(format!(
                "Unknown invoice kind: {}",
                other
            ))),
        }
    }
}

/// One aggregated billing attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub kind: InvoiceKind,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub total_sales_cents: i64,
    pub total_fee_cents: i64,
    pub transaction_count: i32,
    pub transaction_ids: Vec<Uuid>,
    pub status: InvoiceStatus,
    pub external_payment_id: Option<String>,
    pub checkout_url: Option<String>,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub merchant_id: Uuid,
    pub kind: InvoiceKind,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub total_sales_cents: i64,
    pub total_fee_cents: i64,
    pub transaction_ids: Vec<Uuid>,
    pub created_at: OffsetDateTime,
}

/// Fee and sale totals over a snapshot of pending transactions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingTotals {
    pub total_fee_cents: i64,
    pub total_sales_cents: i64,
    pub transaction_count: usize,
    pub transaction_ids: Vec<Uuid>,
}

impl PendingTotals {
    pub fn from_transactions(transactions: &[Transaction]) -> Self {
        transactions.iter().fold(Self::default(), |mut acc, tx| {
            acc.total_fee_cents += tx.fee_amount_cents;
            acc.total_sales_cents += tx.sale_amount_cents;
            acc.transaction_count += 1;
            acc.transaction_ids.push(tx.id);
            acc
        })
    }

    pub fn is_empty(&self) -> bool {
        self.transaction_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            BillingStatus::Active,
            BillingStatus::GracePeriod,
            BillingStatus::UnpaidLockout,
        ] {
            assert_eq!(status.as_str().parse::<BillingStatus>().ok(), Some(status));
        }
        assert!("paused".parse::<BillingStatus>().is_err());
    }

    #[test]
    fn lockout_requires_grace_period_first() {
        assert!(!BillingStatus::Active.can_transition_to(BillingStatus::UnpaidLockout));
        assert!(BillingStatus::Active.can_transition_to(BillingStatus::GracePeriod));
        assert!(BillingStatus::GracePeriod.can_transition_to(BillingStatus::UnpaidLockout));
        assert!(BillingStatus::UnpaidLockout.can_transition_to(BillingStatus::Active));
        assert!(!BillingStatus::UnpaidLockout.can_transition_to(BillingStatus::GracePeriod));
    }

    #[test]
    fn terminal_invoice_states() {
        assert!(InvoiceStatus::Paid.is_terminal());
        assert!(InvoiceStatus::Failed.is_terminal());
        assert!(!InvoiceStatus::Pending.is_terminal());
        assert!(!InvoiceStatus::Processing.is_terminal());
    }
}
