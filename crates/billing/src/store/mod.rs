//! Ledger Store
//!
//! The narrow persistence contract the billing core is written against.
//! Compound operations are atomic in every implementation: the Postgres store
//! runs them in a single transaction, the in-memory store under one write lock.

mod memory;
mod pg;

pub use memory::MemoryLedgerStore;
pub use pg::PgLedgerStore;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    BillingState, BillingStatus, Invoice, InvoiceStatus, Merchant, NewInvoice, NewMerchant,
    NewTransaction, Transaction,
};

/// Result of an idempotent transaction insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// New transaction; the merchant's revenue counter was incremented
    Inserted(Transaction),
    /// A transaction with this external payment id already existed
    Duplicate(Transaction),
}

impl Recorded {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Recorded::Inserted(tx) | Recorded::Duplicate(tx) => tx,
        }
    }
}

/// Merchant-side effect of failing an invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEffect {
    /// An `active` merchant enters a grace period of this length
    EnterGrace(Duration),
    /// The invoice is retired without touching the billing status
    KeepStatus,
}

/// An invoice's terminal write and the merchant change committed with it
#[derive(Debug, Clone)]
pub struct Settled {
    pub invoice: Invoice,
    /// Whether the merchant's billing status moved in the same step
    pub status_changed: bool,
}

/// Final state of a processed webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventResult {
    Success,
    Error(String),
}

/// Webhook claims older than this may be taken over by a new delivery
pub const WEBHOOK_CLAIM_TIMEOUT_MINUTES: i64 = 30;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Merchants

    /// Create a merchant, or return the existing one for this company.
    async fn register_merchant(
        &self,
        merchant: NewMerchant,
        now: OffsetDateTime,
        first_billing_date: OffsetDateTime,
    ) -> BillingResult<Merchant>;

    async fn get_merchant(&self, merchant_id: Uuid) -> BillingResult<Option<Merchant>>;

    async fn find_merchant_by_company(&self, company_id: &str) -> BillingResult<Option<Merchant>>;

    async fn find_merchant_by_user(&self, user_id: &str) -> BillingResult<Option<Merchant>>;

    /// Merchants whose `next_billing_date` has been reached.
    async fn merchants_due_for_billing(&self, now: OffsetDateTime) -> BillingResult<Vec<Merchant>>;

    /// Merchants still marked `grace_period` whose grace window has ended.
    async fn merchants_with_expired_grace(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Merchant>>;

    /// Store the vaulted payment method. Returns `false` for an unknown merchant.
    async fn set_payment_method(
        &self,
        merchant_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<bool>;

    async fn advance_billing_cycle(
        &self,
        merchant_id: Uuid,
        cycle_start: OffsetDateTime,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Compare-and-set the billing state.
    ///
    /// Applies `next` only when the merchant's current status is one of `from`.
    /// Returns whether the write happened.
    async fn transition_billing_state(
        &self,
        merchant_id: Uuid,
        from: &[BillingStatus],
        next: &BillingState,
    ) -> BillingResult<bool>;

    // Transactions

    /// Insert unless the external payment id is already recorded.
    ///
    /// On insert the merchant's `total_revenue_generated_cents` grows by the
    /// sale amount in the same atomic step.
    async fn record_transaction(&self, transaction: NewTransaction) -> BillingResult<Recorded>;

    async fn find_transaction_by_payment_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Transaction>>;

    async fn pending_transactions(&self, merchant_id: Uuid) -> BillingResult<Vec<Transaction>>;

    async fn recent_transactions(
        &self,
        merchant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>>;

    // Invoices

    /// Create a `pending` invoice over an exact snapshot of pending transactions.
    ///
    /// Fails with `InvoiceInFlight` when the merchant already has a pending or
    /// processing invoice, and with `StaleSnapshot` when any captured
    /// transaction is no longer pending.
    async fn create_invoice(&self, invoice: NewInvoice) -> BillingResult<Invoice>;

    /// Move a pending invoice to `processing`, attaching the provider ids known so far.
    async fn mark_invoice_processing(
        &self,
        invoice_id: Uuid,
        external_payment_id: Option<&str>,
        checkout_url: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Fail a non-terminal invoice, bump its retry counter and apply `effect`
    /// to its merchant, all in one atomic step.
    ///
    /// The invoice's transactions stay `pending`. Returns `None` when the
    /// invoice is missing or already terminal.
    async fn mark_invoice_failed(
        &self,
        invoice_id: Uuid,
        reason: &str,
        effect: FailureEffect,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Settled>>;

    /// Settle a processing invoice in one atomic step: its transactions become
    /// `invoiced`, the merchant's cycle restarts at `paid_at` and a merchant in
    /// `grace_period` or `unpaid_lockout` is restored to `active`.
    ///
    /// Returns `None` when the invoice is missing or not processing.
    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: OffsetDateTime,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<Option<Settled>>;

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn find_invoice_by_payment_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Invoice>>;

    async fn recent_invoices(&self, merchant_id: Uuid, limit: i64) -> BillingResult<Vec<Invoice>>;

    /// Invoices in `status` last updated before `cutoff`.
    async fn invoices_in_status_before(
        &self,
        status: InvoiceStatus,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Invoice>>;

    /// Every invoice, for the invariant checker.
    async fn all_invoices(&self) -> BillingResult<Vec<Invoice>>;

    /// Every transaction with `invoiced` status, for the invariant checker.
    async fn invoiced_transactions(&self) -> BillingResult<Vec<Transaction>>;

    /// Every merchant, for the invariant checker.
    async fn all_merchants(&self) -> BillingResult<Vec<Merchant>>;

    // Webhook delivery ledger

    /// Claim exclusive processing rights for a delivery.
    ///
    /// Returns `false` when the event already succeeded or another worker holds
    /// a fresh claim. Errored events and stale claims can be re-claimed.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookEventResult,
    ) -> BillingResult<()>;
}
