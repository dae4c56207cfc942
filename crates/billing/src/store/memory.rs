//! In-memory ledger store for tests and local development

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    FailureEffect, LedgerStore, Recorded, Settled, WebhookEventResult,
    WEBHOOK_CLAIM_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingState, BillingStatus, Invoice, InvoiceStatus, Merchant, NewInvoice, NewMerchant,
    NewTransaction, Transaction, TransactionStatus,
};
use crate::status::{enter_grace, recover};

#[derive(Debug, Clone)]
struct WebhookEventRow {
    processing_result: String,
    processing_started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Default)]
struct Ledger {
    merchants: HashMap<Uuid, Merchant>,
    transactions: HashMap<Uuid, Transaction>,
    transactions_by_payment: HashMap<String, Uuid>,
    invoices: HashMap<Uuid, Invoice>,
    webhook_events: HashMap<String, WebhookEventRow>,
}

/// Ledger store backed by process memory.
///
/// Every compound operation holds the single write lock for its whole
/// duration, which gives it the same all-or-nothing behaviour as the
/// Postgres transactions.
#[derive(Default, Clone)]
pub struct MemoryLedgerStore {
    inner: Arc<RwLock<Ledger>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a merchant record directly
    pub async fn insert_merchant(&self, merchant: Merchant) {
        self.inner
            .write()
            .await
            .merchants
            .insert(merchant.id, merchant);
    }

    /// Number of transactions recorded, across all merchants
    pub async fn transaction_count(&self) -> usize {
        self.inner.read().await.transactions.len()
    }

    /// Processing result recorded for a webhook delivery
    pub async fn webhook_event_result(&self, event_id: &str) -> Option<(String, Option<String>)> {
        self.inner
            .read()
            .await
            .webhook_events
            .get(event_id)
            .map(|row| (row.processing_result.clone(), row.error_message.clone()))
    }
}

fn newest_first<T, F>(mut items: Vec<T>, created_at: F, limit: i64) -> Vec<T>
where
    F: Fn(&T) -> OffsetDateTime,
{
    items.sort_by_key(|item| std::cmp::Reverse(created_at(item)));
    items.truncate(limit.max(0) as usize);
    items
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn register_merchant(
        &self,
        merchant: NewMerchant,
        now: OffsetDateTime,
        first_billing_date: OffsetDateTime,
    ) -> BillingResult<Merchant> {
        let mut ledger = self.inner.write().await;

        if let Some(existing) = ledger
            .merchants
            .values()
            .find(|m| m.external_company_id == merchant.external_company_id)
        {
            return Ok(existing.clone());
        }
        if ledger
            .merchants
            .values()
            .any(|m| m.external_user_id == merchant.external_user_id)
        {
            return Err(BillingError::Validation(format!(
                "User {} already owns a registered company",
                merchant.external_user_id
            )));
        }

        let record = Merchant {
            id: Uuid::new_v4(),
            external_user_id: merchant.external_user_id,
            external_company_id: merchant.external_company_id,
            billing_status: BillingStatus::Active,
            payment_method_id: None,
            payment_method_connected: false,
            billing_cycle_start: now,
            next_billing_date: first_billing_date,
            payment_failed_at: None,
            grace_period_ends_at: None,
            last_failed_invoice_id: None,
            total_revenue_generated_cents: 0,
            created_at: now,
            updated_at: now,
        };
        ledger.merchants.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_merchant(&self, merchant_id: Uuid) -> BillingResult<Option<Merchant>> {
        Ok(self.inner.read().await.merchants.get(&merchant_id).cloned())
    }

    async fn find_merchant_by_company(&self, company_id: &str) -> BillingResult<Option<Merchant>> {
        Ok(self
            .inner
            .read()
            .await
            .merchants
            .values()
            .find(|m| m.external_company_id == company_id)
            .cloned())
    }

    async fn find_merchant_by_user(&self, user_id: &str) -> BillingResult<Option<Merchant>> {
        Ok(self
            .inner
            .read()
            .await
            .merchants
            .values()
            .find(|m| m.external_user_id == user_id)
            .cloned())
    }

    async fn merchants_due_for_billing(&self, now: OffsetDateTime) -> BillingResult<Vec<Merchant>> {
        let mut due: Vec<Merchant> = self
            .inner
            .read()
            .await
            .merchants
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.next_billing_date);
        Ok(due)
    }

    async fn merchants_with_expired_grace(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Merchant>> {
        Ok(self
            .inner
            .read()
            .await
            .merchants
            .values()
            .filter(|m| {
                m.billing_status == BillingStatus::GracePeriod
                    && m.grace_period_ends_at.is_some_and(|ends| ends <= now)
            })
            .cloned()
            .collect())
    }

    async fn set_payment_method(
        &self,
        merchant_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<bool> {
        let mut ledger = self.inner.write().await;
        match ledger.merchants.get_mut(&merchant_id) {
            Some(merchant) => {
                merchant.payment_method_id = Some(payment_method_id.to_string());
                merchant.payment_method_connected = true;
                merchant.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn advance_billing_cycle(
        &self,
        merchant_id: Uuid,
        cycle_start: OffsetDateTime,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut ledger = self.inner.write().await;
        let merchant = ledger
            .merchants
            .get_mut(&merchant_id)
            .ok_or_else(|| BillingError::NotFound(format!("Merchant {}", merchant_id)))?;
        merchant.billing_cycle_start = cycle_start;
        merchant.next_billing_date = next_billing_date;
        merchant.updated_at = cycle_start;
        Ok(())
    }

    async fn transition_billing_state(
        &self,
        merchant_id: Uuid,
        from: &[BillingStatus],
        next: &BillingState,
    ) -> BillingResult<bool> {
        let mut ledger = self.inner.write().await;
        let Some(merchant) = ledger.merchants.get_mut(&merchant_id) else {
            return Ok(false);
        };
        if !from.contains(&merchant.billing_status) {
            return Ok(false);
        }
        merchant.apply_billing_state(next.clone());
        merchant.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn record_transaction(&self, transaction: NewTransaction) -> BillingResult<Recorded> {
        let mut ledger = self.inner.write().await;

        if let Some(existing) = ledger
            .transactions_by_payment
            .get(&transaction.external_payment_id)
            .and_then(|id| ledger.transactions.get(id))
        {
            return Ok(Recorded::Duplicate(existing.clone()));
        }

        let merchant = ledger
            .merchants
            .get_mut(&transaction.merchant_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("Merchant {}", transaction.merchant_id))
            })?;
        merchant.total_revenue_generated_cents += transaction.sale_amount_cents;

        let record = Transaction {
            id: Uuid::new_v4(),
            merchant_id: transaction.merchant_id,
            external_payment_id: transaction.external_payment_id,
            product_id: transaction.product_id,
            product_name: transaction.product_name,
            sale_amount_cents: transaction.sale_amount_cents,
            fee_amount_cents: transaction.fee_amount_cents,
            currency: transaction.currency,
            status: TransactionStatus::Pending,
            invoice_id: None,
            created_at: transaction.created_at,
        };
        ledger
            .transactions_by_payment
            .insert(record.external_payment_id.clone(), record.id);
        ledger.transactions.insert(record.id, record.clone());
        Ok(Recorded::Inserted(record))
    }

    async fn find_transaction_by_payment_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let ledger = self.inner.read().await;
        Ok(ledger
            .transactions_by_payment
            .get(external_payment_id)
            .and_then(|id| ledger.transactions.get(id))
            .cloned())
    }

    async fn pending_transactions(&self, merchant_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let mut pending: Vec<Transaction> = self
            .inner
            .read()
            .await
            .transactions
            .values()
            .filter(|t| t.merchant_id == merchant_id && t.status == TransactionStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }

    async fn recent_transactions(
        &self,
        merchant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let items: Vec<Transaction> = self
            .inner
            .read()
            .await
            .transactions
            .values()
            .filter(|t| t.merchant_id == merchant_id)
            .cloned()
            .collect();
        Ok(newest_first(items, |t| t.created_at, limit))
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> BillingResult<Invoice> {
        let mut ledger = self.inner.write().await;

        if ledger
            .invoices
            .values()
            .any(|i| i.merchant_id == invoice.merchant_id && !i.status.is_terminal())
        {
            return Err(BillingError::InvoiceInFlight(invoice.merchant_id));
        }

        let snapshot_is_pending = invoice.transaction_ids.iter().all(|id| {
            ledger.transactions.get(id).is_some_and(|t| {
                t.merchant_id == invoice.merchant_id && t.status == TransactionStatus::Pending
            })
        });
        if !snapshot_is_pending {
            return Err(BillingError::StaleSnapshot);
        }

        let record = Invoice {
            id: Uuid::new_v4(),
            merchant_id: invoice.merchant_id,
            kind: invoice.kind,
            period_start: invoice.period_start,
            period_end: invoice.period_end,
            total_sales_cents: invoice.total_sales_cents,
            total_fee_cents: invoice.total_fee_cents,
            transaction_count: invoice.transaction_ids.len() as i32,
            transaction_ids: invoice.transaction_ids,
            status: InvoiceStatus::Pending,
            external_payment_id: None,
            checkout_url: None,
            failure_reason: None,
            paid_at: None,
            retry_count: 0,
            created_at: invoice.created_at,
            updated_at: invoice.created_at,
        };
        ledger.invoices.insert(record.id, record.clone());
        Ok(record)
    }

    async fn mark_invoice_processing(
        &self,
        invoice_id: Uuid,
        external_payment_id: Option<&str>,
        checkout_url: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut ledger = self.inner.write().await;
        let Some(invoice) = ledger.invoices.get_mut(&invoice_id) else {
            return Ok(false);
        };
        if invoice.status.is_terminal() {
            return Ok(false);
        }
        invoice.status = InvoiceStatus::Processing;
        if let Some(payment_id) = external_payment_id {
            invoice.external_payment_id = Some(payment_id.to_string());
        }
        if let Some(url) = checkout_url {
            invoice.checkout_url = Some(url.to_string());
        }
        invoice.updated_at = now;
        Ok(true)
    }

    async fn mark_invoice_failed(
        &self,
        invoice_id: Uuid,
        reason: &str,
        effect: FailureEffect,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Settled>> {
        let mut ledger = self.inner.write().await;
        let Some(invoice) = ledger.invoices.get(&invoice_id) else {
            return Ok(None);
        };
        if invoice.status.is_terminal() {
            return Ok(None);
        }
        let merchant_id = invoice.merchant_id;
        let grace = match (effect, ledger.merchants.get(&merchant_id)) {
            (FailureEffect::EnterGrace(grace_period), Some(merchant)) => {
                enter_grace(&merchant.billing_state(), invoice_id, now, grace_period)
            }
            (FailureEffect::EnterGrace(_), None) => {
                return Err(BillingError::NotFound(format!("Merchant {}", merchant_id)));
            }
            (FailureEffect::KeepStatus, _) => None,
        };

        let Some(invoice) = ledger.invoices.get_mut(&invoice_id) else {
            return Ok(None);
        };
        invoice.status = InvoiceStatus::Failed;
        invoice.failure_reason = Some(reason.to_string());
        invoice.retry_count += 1;
        invoice.updated_at = now;
        let invoice = invoice.clone();

        let status_changed = grace.is_some();
        if let (Some(next), Some(merchant)) = (grace, ledger.merchants.get_mut(&merchant_id)) {
            merchant.apply_billing_state(next);
            merchant.updated_at = now;
        }
        Ok(Some(Settled {
            invoice,
            status_changed,
        }))
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: OffsetDateTime,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<Option<Settled>> {
        let mut ledger = self.inner.write().await;
        let Some(invoice) = ledger.invoices.get(&invoice_id) else {
            return Ok(None);
        };
        if invoice.status != InvoiceStatus::Processing {
            return Ok(None);
        }
        let merchant_id = invoice.merchant_id;
        let Some(merchant) = ledger.merchants.get(&merchant_id) else {
            return Err(BillingError::NotFound(format!("Merchant {}", merchant_id)));
        };
        let recovered = recover(&merchant.billing_state());

        let Some(invoice) = ledger.invoices.get_mut(&invoice_id) else {
            return Ok(None);
        };
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(paid_at);
        invoice.updated_at = paid_at;
        let settled = invoice.clone();

        for transaction_id in &settled.transaction_ids {
            if let Some(tx) = ledger.transactions.get_mut(transaction_id) {
                tx.status = TransactionStatus::Invoiced;
                tx.invoice_id = Some(settled.id);
            }
        }

        let status_changed = recovered.is_some();
        if let Some(merchant) = ledger.merchants.get_mut(&merchant_id) {
            merchant.billing_cycle_start = paid_at;
            merchant.next_billing_date = next_billing_date;
            if let Some(next) = recovered {
                merchant.apply_billing_state(next);
            }
            merchant.updated_at = paid_at;
        }
        Ok(Some(Settled {
            invoice: settled,
            status_changed,
        }))
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.inner.read().await.invoices.get(&invoice_id).cloned())
    }

    async fn find_invoice_by_payment_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self
            .inner
            .read()
            .await
            .invoices
            .values()
            .find(|i| i.external_payment_id.as_deref() == Some(external_payment_id))
            .cloned())
    }

    async fn recent_invoices(&self, merchant_id: Uuid, limit: i64) -> BillingResult<Vec<Invoice>> {
        let items: Vec<Invoice> = self
            .inner
            .read()
            .await
            .invoices
            .values()
            .filter(|i| i.merchant_id == merchant_id)
            .cloned()
            .collect();
        Ok(newest_first(items, |i| i.created_at, limit))
    }

    async fn invoices_in_status_before(
        &self,
        status: InvoiceStatus,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Invoice>> {
        Ok(self
            .inner
            .read()
            .await
            .invoices
            .values()
            .filter(|i| i.status == status && i.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn all_invoices(&self) -> BillingResult<Vec<Invoice>> {
        Ok(self.inner.read().await.invoices.values().cloned().collect())
    }

    async fn invoiced_transactions(&self) -> BillingResult<Vec<Transaction>> {
        Ok(self
            .inner
            .read()
            .await
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Invoiced)
            .cloned()
            .collect())
    }

    async fn all_merchants(&self) -> BillingResult<Vec<Merchant>> {
        Ok(self.inner.read().await.merchants.values().cloned().collect())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut ledger = self.inner.write().await;
        let stale_before = now - Duration::minutes(WEBHOOK_CLAIM_TIMEOUT_MINUTES);

        let claimable = match ledger.webhook_events.get(event_id) {
            None => true,
            Some(row) => match row.processing_result.as_str() {
                "success" => false,
                "processing" => row.processing_started_at < stale_before,
                _ => true,
            },
        };
        if claimable {
            ledger.webhook_events.insert(
                event_id.to_string(),
                WebhookEventRow {
                    processing_result: "processing".to_string(),
                    processing_started_at: now,
                    error_message: None,
                },
            );
        }
        Ok(claimable)
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookEventResult,
    ) -> BillingResult<()> {
        let mut ledger = self.inner.write().await;
        if let Some(row) = ledger.webhook_events.get_mut(event_id) {
            match result {
                WebhookEventResult::Success => {
                    row.processing_result = "success".to_string();
                    row.error_message = None;
                }
                WebhookEventResult::Error(message) => {
                    row.processing_result = "error".to_string();
                    row.error_message = Some(message);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::InvoiceKind;

    fn sale(merchant_id: Uuid, payment_id: &str, sale_cents: i64) -> NewTransaction {
        NewTransaction {
            merchant_id,
            external_payment_id: payment_id.to_string(),
            product_id: "prod_1".to_string(),
            product_name: "Course".to_string(),
            sale_amount_cents: sale_cents,
            fee_amount_cents: sale_cents / 20,
            currency: "usd".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    async fn merchant(store: &MemoryLedgerStore) -> Merchant {
        let now = OffsetDateTime::now_utc();
        store
            .register_merchant(
                NewMerchant {
                    external_user_id: "user_1".to_string(),
                    external_company_id: "biz_1".to_string(),
                },
                now,
                now + Duration::days(7),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent_per_company() {
        let store = MemoryLedgerStore::new();
        let first = merchant(&store).await;
        let second = merchant(&store).await;
        assert_eq!(first.id, second.id);
        assert_eq!(store.all_merchants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_payment_id_does_not_double_count_revenue() {
        let store = MemoryLedgerStore::new();
        let m = merchant(&store).await;

        let first = store.record_transaction(sale(m.id, "pay_1", 1000)).await.unwrap();
        let second = store.record_transaction(sale(m.id, "pay_1", 1000)).await.unwrap();

        assert!(matches!(first, Recorded::Inserted(_)));
        assert!(matches!(second, Recorded::Duplicate(_)));
        assert_eq!(first.transaction().id, second.transaction().id);
        let m = store.get_merchant(m.id).await.unwrap().unwrap();
        assert_eq!(m.total_revenue_generated_cents, 1000);
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn second_in_flight_invoice_is_rejected() {
        let store = MemoryLedgerStore::new();
        let m = merchant(&store).await;
        let tx = store.record_transaction(sale(m.id, "pay_1", 3000)).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let new_invoice = NewInvoice {
            merchant_id: m.id,
            kind: InvoiceKind::Scheduled,
            period_start: now,
            period_end: now,
            total_sales_cents: 3000,
            total_fee_cents: 150,
            transaction_ids: vec![tx.transaction().id],
            created_at: now,
        };
        store.create_invoice(new_invoice.clone()).await.unwrap();

        let err = store.create_invoice(new_invoice).await.unwrap_err();
        assert!(matches!(err, BillingError::InvoiceInFlight(id) if id == m.id));
    }

    #[tokio::test]
    async fn paid_invoice_cannot_be_failed_afterwards() {
        let store = MemoryLedgerStore::new();
        let m = merchant(&store).await;
        let tx = store.record_transaction(sale(m.id, "pay_1", 3000)).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let invoice = store
            .create_invoice(NewInvoice {
                merchant_id: m.id,
                kind: InvoiceKind::Scheduled,
                period_start: now,
                period_end: now,
                total_sales_cents: 3000,
                total_fee_cents: 150,
                transaction_ids: vec![tx.transaction().id],
                created_at: now,
            })
            .await
            .unwrap();
        assert!(store
            .mark_invoice_processing(invoice.id, Some("pay_fee_1"), None, now)
            .await
            .unwrap());
        let next = now + Duration::days(7);
        assert!(store.mark_invoice_paid(invoice.id, now, next).await.unwrap().is_some());

        assert!(store
            .mark_invoice_failed(invoice.id, "late failure", FailureEffect::KeepStatus, now)
            .await
            .unwrap()
            .is_none());
        assert!(store.mark_invoice_paid(invoice.id, now, next).await.unwrap().is_none());
        assert!(store.pending_transactions(m.id).await.unwrap().is_empty());
    }

    async fn processing_invoice(store: &MemoryLedgerStore, m: &Merchant, now: OffsetDateTime) -> Invoice {
        let tx = store.record_transaction(sale(m.id, "pay_1", 3000)).await.unwrap();
        let invoice = store
            .create_invoice(NewInvoice {
                merchant_id: m.id,
                kind: InvoiceKind::Scheduled,
                period_start: now,
                period_end: now,
                total_sales_cents: 3000,
                total_fee_cents: 150,
                transaction_ids: vec![tx.transaction().id],
                created_at: now,
            })
            .await
            .unwrap();
        store
            .mark_invoice_processing(invoice.id, Some("pay_fee_1"), None, now)
            .await
            .unwrap();
        invoice
    }

    #[tokio::test]
    async fn failing_an_invoice_enters_grace_in_the_same_step() {
        let store = MemoryLedgerStore::new();
        let m = merchant(&store).await;
        let now = OffsetDateTime::now_utc();
        let invoice = processing_invoice(&store, &m, now).await;

        let settled = store
            .mark_invoice_failed(
                invoice.id,
                "card_declined",
                FailureEffect::EnterGrace(Duration::hours(48)),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        assert!(settled.status_changed);
        assert_eq!(settled.invoice.status, InvoiceStatus::Failed);

        let m = store.get_merchant(m.id).await.unwrap().unwrap();
        assert_eq!(m.billing_status, BillingStatus::GracePeriod);
        assert_eq!(m.grace_period_ends_at, Some(now + Duration::hours(48)));
        assert_eq!(m.last_failed_invoice_id, Some(invoice.id));
        // Failed invoices release their transactions
        assert_eq!(store.pending_transactions(m.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keep_status_failure_leaves_merchant_active() {
        let store = MemoryLedgerStore::new();
        let m = merchant(&store).await;
        let now = OffsetDateTime::now_utc();
        let invoice = processing_invoice(&store, &m, now).await;

        let settled = store
            .mark_invoice_failed(invoice.id, "superseded", FailureEffect::KeepStatus, now)
            .await
            .unwrap()
            .unwrap();
        assert!(!settled.status_changed);
        let m = store.get_merchant(m.id).await.unwrap().unwrap();
        assert_eq!(m.billing_status, BillingStatus::Active);
    }

    #[tokio::test]
    async fn paying_an_invoice_restores_merchant_and_advances_cycle() {
        let store = MemoryLedgerStore::new();
        let m = merchant(&store).await;
        let now = OffsetDateTime::now_utc();
        let grace = enter_grace(&m.billing_state(), Uuid::new_v4(), now, Duration::hours(48)).unwrap();
        assert!(store
            .transition_billing_state(m.id, &[BillingStatus::Active], &grace)
            .await
            .unwrap());
        let invoice = processing_invoice(&store, &m, now).await;

        let paid_at = now + Duration::hours(1);
        let settled = store
            .mark_invoice_paid(invoice.id, paid_at, paid_at + Duration::days(7))
            .await
            .unwrap()
            .unwrap();
        assert!(settled.status_changed);

        let m = store.get_merchant(m.id).await.unwrap().unwrap();
        assert_eq!(m.billing_status, BillingStatus::Active);
        assert_eq!(m.grace_period_ends_at, None);
        assert_eq!(m.billing_cycle_start, paid_at);
        assert_eq!(m.next_billing_date, paid_at + Duration::days(7));
        assert!(store.pending_transactions(m.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_claims_are_exclusive_until_completed() {
        let store = MemoryLedgerStore::new();
        let now = OffsetDateTime::now_utc();

        assert!(store.claim_webhook_event("evt_1", "payment.succeeded", now).await.unwrap());
        assert!(!store.claim_webhook_event("evt_1", "payment.succeeded", now).await.unwrap());

        store
            .complete_webhook_event("evt_1", WebhookEventResult::Error("boom".to_string()))
            .await
            .unwrap();
        assert!(store.claim_webhook_event("evt_1", "payment.succeeded", now).await.unwrap());

        store
            .complete_webhook_event("evt_1", WebhookEventResult::Success)
            .await
            .unwrap();
        assert!(!store.claim_webhook_event("evt_1", "payment.succeeded", now).await.unwrap());
    }

    #[tokio::test]
    async fn stale_claims_can_be_recovered() {
        let store = MemoryLedgerStore::new();
        let then = OffsetDateTime::now_utc() - Duration::hours(1);

        assert!(store.claim_webhook_event("evt_2", "payment.failed", then).await.unwrap());
        assert!(store
            .claim_webhook_event("evt_2", "payment.failed", OffsetDateTime::now_utc())
            .await
            .unwrap());
    }
}
