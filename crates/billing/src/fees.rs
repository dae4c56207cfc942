//! Fee Accrual
//!
//! Turns each tracked merchant sale into a `pending` fee transaction. Sales are
//! keyed by the provider's payment id, so redelivered webhooks never produce a
//! second transaction or a second revenue increment.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{NewTransaction, Transaction};
use crate::policy::BillingPolicy;
use crate::store::{LedgerStore, Recorded};

/// A completed merchant sale reported by the provider
#[derive(Debug, Clone)]
pub struct RecordSale {
    pub merchant_id: Uuid,
    pub external_payment_id: String,
    pub product_id: String,
    pub product_name: String,
    pub sale_amount_cents: i64,
    pub currency: String,
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "transaction", rename_all = "snake_case")]
pub enum SaleOutcome {
    Recorded(Transaction),
    /// The payment id was already recorded; nothing changed
    Duplicate(Transaction),
}

impl SaleOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            SaleOutcome::Recorded(tx) | SaleOutcome::Duplicate(tx) => tx,
        }
    }
}

pub struct FeeAccrual {
    store: Arc<dyn LedgerStore>,
    policy: BillingPolicy,
}

impl FeeAccrual {
    pub fn new(store: Arc<dyn LedgerStore>, policy: BillingPolicy) -> Self {
        Self { store, policy }
    }

    /// Record the platform fee owed on a sale.
    ///
    /// Billing status is never consulted or changed here: merchants in grace
    /// or lockout keep accruing fees.
    pub async fn record_sale(&self, sale: RecordSale) -> BillingResult<SaleOutcome> {
        if sale.external_payment_id.trim().is_empty() {
            return Err(BillingError::Validation(
                "external payment id is required".to_string(),
            ));
        }
        if sale.sale_amount_cents < 0 {
            return Err(BillingError::Validation(format!(
                "sale amount cannot be negative: {}",
                sale.sale_amount_cents
            )));
        }
        if sale.currency.trim().is_empty() {
            return Err(BillingError::Validation("currency is required".to_string()));
        }

        if self.store.get_merchant(sale.merchant_id).await?.is_none() {
            return Err(BillingError::NotFound(format!(
                "Merchant {}",
                sale.merchant_id
            )));
        }

        let fee_amount_cents = self.policy.fee_for_sale(sale.sale_amount_cents);

        let recorded = self
            .store
            .record_transaction(NewTransaction {
                merchant_id: sale.merchant_id,
                external_payment_id: sale.external_payment_id,
                product_id: sale.product_id,
                product_name: sale.product_name,
                sale_amount_cents: sale.sale_amount_cents,
                fee_amount_cents,
                currency: sale.currency.trim().to_lowercase(),
                created_at: sale.occurred_at,
            })
            .await?;

        match recorded {
            Recorded::Inserted(tx) => {
                tracing::info!(
                    merchant_id = %tx.merchant_id,
                    transaction_id = %tx.id,
                    payment_id = %tx.external_payment_id,
                    sale_cents = tx.sale_amount_cents,
                    fee_cents = tx.fee_amount_cents,
                    "Recorded sale fee"
                );
                Ok(SaleOutcome::Recorded(tx))
            }
            Recorded::Duplicate(tx) => {
                tracing::debug!(
                    payment_id = %tx.external_payment_id,
                    "Sale already recorded, skipping"
                );
                Ok(SaleOutcome::Duplicate(tx))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMerchant;
    use crate::store::MemoryLedgerStore;
    use time::Duration;

    async fn setup() -> (Arc<MemoryLedgerStore>, FeeAccrual, Uuid) {
        let store = Arc::new(MemoryLedgerStore::new());
        let now = OffsetDateTime::now_utc();
        let merchant = store
            .register_merchant(
                NewMerchant {
                    external_user_id: "user_fee".to_string(),
                    external_company_id: "biz_fee".to_string(),
                },
                now,
                now + Duration::days(7),
            )
            .await
            .unwrap();
        let accrual = FeeAccrual::new(store.clone(), BillingPolicy::default());
        (store, accrual, merchant.id)
    }

    fn sale(merchant_id: Uuid, payment_id: &str, cents: i64) -> RecordSale {
        RecordSale {
            merchant_id,
            external_payment_id: payment_id.to_string(),
            product_id: "prod_1".to_string(),
            product_name: "Workshop".to_string(),
            sale_amount_cents: cents,
            currency: "USD".to_string(),
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn fee_is_five_percent_rounded_to_the_cent() {
        let (_, accrual, merchant_id) = setup().await;

        let outcome = accrual.record_sale(sale(merchant_id, "pay_a", 4_999)).await.unwrap();
        assert_eq!(outcome.transaction().fee_amount_cents, 250);
        assert_eq!(outcome.transaction().currency, "usd");

        let outcome = accrual.record_sale(sale(merchant_id, "pay_b", 9)).await.unwrap();
        assert_eq!(outcome.transaction().fee_amount_cents, 0);
    }

    #[tokio::test]
    async fn zero_amount_sale_is_recorded_with_zero_fee() {
        let (_, accrual, merchant_id) = setup().await;
        let outcome = accrual.record_sale(sale(merchant_id, "pay_free", 0)).await.unwrap();
        assert!(matches!(outcome, SaleOutcome::Recorded(_)));
        assert_eq!(outcome.transaction().fee_amount_cents, 0);
    }

    #[tokio::test]
    async fn rejects_invalid_sales() {
        let (_, accrual, merchant_id) = setup().await;

        let err = accrual.record_sale(sale(merchant_id, " ", 100)).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = accrual.record_sale(sale(merchant_id, "pay_neg", -1)).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        let err = accrual
            .record_sale(sale(Uuid::new_v4(), "pay_orphan", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let (store, accrual, merchant_id) = setup().await;

        accrual.record_sale(sale(merchant_id, "pay_dup", 2_000)).await.unwrap();
        let second = accrual.record_sale(sale(merchant_id, "pay_dup", 2_000)).await.unwrap();

        assert!(matches!(second, SaleOutcome::Duplicate(_)));
        assert_eq!(store.pending_transactions(merchant_id).await.unwrap().len(), 1);
        let merchant = store.get_merchant(merchant_id).await.unwrap().unwrap();
        assert_eq!(merchant.total_revenue_generated_cents, 2_000);
    }
}
