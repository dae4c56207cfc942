// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::BelowMinimum carries both totals
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Stacker Billing Module
//!
//! Meters a percentage fee on every merchant sale reported by Whop and
//! collects it weekly from the merchant's saved payment method.
//!
//! ## Features
//!
//! - **Fee Accrual**: One pending fee transaction per sale, idempotent by payment id
//! - **Billing Cycle**: Weekly sweep that invoices and charges due merchants
//! - **Reconciliation**: Whop webhooks settle invoices and record sales
//! - **Billing Status**: Grace period after a failed charge, lockout when it expires
//! - **Manual Retry / Pay-Now**: Merchant-initiated charges outside the cycle
//! - **Invariants**: Read-only ledger consistency checks

pub mod client;
pub mod cycle;
pub mod error;
pub mod fees;
pub mod invariants;
mod invoicing;
pub mod manual_charge;
pub mod models;
pub mod policy;
pub mod reconciliation;
pub mod status;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Client
pub use client::{PaymentMethodSummary, PaymentProvider, ProviderError, WhopClient, WhopConfig};

// Cycle
pub use cycle::{BillingCycle, BillingCycleReport, CycleOutcome, MerchantCycleOutcome, SkipReason};

// Error
pub use error::{BillingError, BillingResult};

// Fees
pub use fees::{FeeAccrual, RecordSale, SaleOutcome};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Manual charges
pub use manual_charge::{ManualCharge, PayNowOutcome, RetryOutcome};

// Models
pub use models::{
    BillingState, BillingStatus, Invoice, InvoiceKind, InvoiceStatus, Merchant, NewMerchant,
    Transaction, TransactionStatus,
};

// Policy
pub use policy::BillingPolicy;

// Reconciliation
pub use reconciliation::{ReconcileOutcome, Reconciler};

// Status
pub use status::{BillingStateMachine, BillingStatusView};

// Store
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

// Webhooks
pub use webhooks::{
    SignatureHeaders, WebhookDisposition, WebhookEvent, WebhookHandler, WebhookVerifier,
};

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use models::PendingTotals;

/// Transactions and invoices listed in the billing overview
pub const OVERVIEW_RECENT_LIMIT: i64 = 10;

/// Everything the merchant billing page shows
#[derive(Debug, Clone, Serialize)]
pub struct BillingOverview {
    pub merchant_id: Uuid,
    #[serde(flatten)]
    pub status: BillingStatusView,
    pub payment_method_connected: bool,
    pub pending_fee_cents: i64,
    pub pending_sales_cents: i64,
    pub pending_transaction_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub next_billing_date: OffsetDateTime,
    pub total_revenue_generated_cents: i64,
    pub recent_transactions: Vec<Transaction>,
    pub recent_invoices: Vec<Invoice>,
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: Arc<dyn LedgerStore>,
    pub provider: Arc<dyn PaymentProvider>,
    pub policy: BillingPolicy,
    pub fees: FeeAccrual,
    pub cycle: BillingCycle,
    pub reconciler: Arc<Reconciler>,
    pub status: BillingStateMachine,
    pub manual: ManualCharge,
    pub invariants: InvariantChecker,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let whop = WhopClient::from_env()?;
        let config = whop.config().clone();
        Self::new(
            Arc::new(PgLedgerStore::new(pool)),
            Arc::new(whop),
            BillingPolicy::from_env(),
            &config,
        )
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn PaymentProvider>,
        policy: BillingPolicy,
        config: &WhopConfig,
    ) -> BillingResult<Self> {
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            provider.clone(),
            policy.clone(),
            config.billing_company_id.clone(),
        ));
        let verifier = WebhookVerifier::new(&config.webhook_secret)?;

        Ok(Self {
            fees: FeeAccrual::new(store.clone(), policy.clone()),
            cycle: BillingCycle::new(store.clone(), provider.clone(), policy.clone()),
            status: BillingStateMachine::new(store.clone()),
            manual: ManualCharge::new(
                store.clone(),
                provider.clone(),
                policy.clone(),
                config.pay_now_redirect_url.clone(),
            ),
            invariants: InvariantChecker::new(store.clone(), policy.stale_processing_after),
            webhooks: WebhookHandler::new(verifier, reconciler.clone(), store.clone()),
            reconciler,
            store,
            provider,
            policy,
        })
    }

    /// Register a merchant on first interaction; returns the existing record on repeat calls.
    pub async fn register_merchant(
        &self,
        merchant: NewMerchant,
        now: OffsetDateTime,
    ) -> BillingResult<Merchant> {
        if merchant.external_user_id.trim().is_empty()
            || merchant.external_company_id.trim().is_empty()
        {
            return Err(BillingError::Validation(
                "user id and company id are required".to_string(),
            ));
        }
        let registered = self
            .store
            .register_merchant(merchant, now, now + self.policy.billing_interval)
            .await?;
        tracing::info!(
            merchant_id = %registered.id,
            company_id = %registered.external_company_id,
            "Merchant registered"
        );
        Ok(registered)
    }

    pub async fn merchant(&self, merchant_id: Uuid) -> BillingResult<Merchant> {
        self.store
            .get_merchant(merchant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Merchant {}", merchant_id)))
    }

    pub async fn merchant_for_user(&self, user_id: &str) -> BillingResult<Merchant> {
        self.store
            .find_merchant_by_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No merchant for user {}", user_id)))
    }

    /// Billing status projection with pending totals and recent history
    pub async fn billing_overview(
        &self,
        merchant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<BillingOverview> {
        let merchant = self.status.evaluate(self.merchant(merchant_id).await?, now).await?;
        let pending = PendingTotals::from_transactions(
            &self.store.pending_transactions(merchant.id).await?,
        );

        Ok(BillingOverview {
            merchant_id: merchant.id,
            status: BillingStatusView::project(&merchant.billing_state(), now),
            payment_method_connected: merchant.payment_method_connected,
            pending_fee_cents: pending.total_fee_cents,
            pending_sales_cents: pending.total_sales_cents,
            pending_transaction_count: pending.transaction_count,
            next_billing_date: merchant.next_billing_date,
            total_revenue_generated_cents: merchant.total_revenue_generated_cents,
            recent_transactions: self
                .store
                .recent_transactions(merchant.id, OVERVIEW_RECENT_LIMIT)
                .await?,
            recent_invoices: self
                .store
                .recent_invoices(merchant.id, OVERVIEW_RECENT_LIMIT)
                .await?,
        })
    }

    /// Saved payment methods the merchant can be charged with
    pub async fn payment_methods(
        &self,
        merchant_id: Uuid,
    ) -> BillingResult<Vec<PaymentMethodSummary>> {
        let merchant = self.merchant(merchant_id).await?;
        Ok(self
            .provider
            .list_payment_methods(&merchant.external_user_id)
            .await?)
    }
}
