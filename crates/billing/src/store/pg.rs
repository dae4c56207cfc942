//! Postgres ledger store

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    FailureEffect, LedgerStore, Recorded, Settled, WebhookEventResult,
    WEBHOOK_CLAIM_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingState, BillingStatus, Invoice, InvoiceStatus, Merchant, NewInvoice, NewMerchant,
    NewTransaction, Transaction,
};
use crate::status::{enter_grace, recover};

const MERCHANT_COLUMNS: &str = r#"
    id, external_user_id, external_company_id, billing_status, payment_method_id,
    payment_method_connected, billing_cycle_start, next_billing_date, payment_failed_at,
    grace_period_ends_at, last_failed_invoice_id, total_revenue_generated_cents,
    created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, merchant_id, external_payment_id, product_id, product_name, sale_amount_cents,
    fee_amount_cents, currency, status, invoice_id, created_at
"#;

const INVOICE_COLUMNS: &str = r#"
    id, merchant_id, kind, period_start, period_end, total_sales_cents, total_fee_cents,
    transaction_count, transaction_ids, status, external_payment_id, checkout_url,
    failure_reason, paid_at, retry_count, created_at, updated_at
"#;

/// Unique index guarding one pending/processing invoice per merchant
const IN_FLIGHT_INDEX: &str = "idx_invoices_one_in_flight";

#[derive(FromRow)]
struct MerchantRow {
    id: Uuid,
    external_user_id: String,
    external_company_id: String,
    billing_status: String,
    payment_method_id: Option<String>,
    payment_method_connected: bool,
    billing_cycle_start: OffsetDateTime,
    next_billing_date: OffsetDateTime,
    payment_failed_at: Option<OffsetDateTime>,
    grace_period_ends_at: Option<OffsetDateTime>,
    last_failed_invoice_id: Option<Uuid>,
    total_revenue_generated_cents: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<MerchantRow> for Merchant {
    type Error = BillingError;

    fn try_from(row: MerchantRow) -> Result<Self, Self::Error> {
        Ok(Merchant {
            id: row.id,
            external_user_id: row.external_user_id,
            external_company_id: row.external_company_id,
            billing_status: row.billing_status.parse()?,
            payment_method_id: row.payment_method_id,
            payment_method_connected: row.payment_method_connected,
            billing_cycle_start: row.billing_cycle_start,
            next_billing_date: row.next_billing_date,
            payment_failed_at: row.payment_failed_at,
            grace_period_ends_at: row.grace_period_ends_at,
            last_failed_invoice_id: row.last_failed_invoice_id,
            total_revenue_generated_cents: row.total_revenue_generated_cents,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    merchant_id: Uuid,
    external_payment_id: String,
    product_id: String,
    product_name: String,
    sale_amount_cents: i64,
    fee_amount_cents: i64,
    currency: String,
    status: String,
    invoice_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            merchant_id: row.merchant_id,
            external_payment_id: row.external_payment_id,
            product_id: row.product_id,
            product_name: row.product_name,
            sale_amount_cents: row.sale_amount_cents,
            fee_amount_cents: row.fee_amount_cents,
            currency: row.currency,
            status: row.status.parse()?,
            invoice_id: row.invoice_id,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct InvoiceRow {
    id: Uuid,
    merchant_id: Uuid,
    kind: String,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    total_sales_cents: i64,
    total_fee_cents: i64,
    transaction_count: i32,
    transaction_ids: Vec<Uuid>,
    status: String,
    external_payment_id: Option<String>,
    checkout_url: Option<String>,
    failure_reason: Option<String>,
    paid_at: Option<OffsetDateTime>,
    retry_count: i32,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            id: row.id,
            merchant_id: row.merchant_id,
            kind: row.kind.parse()?,
            period_start: row.period_start,
            period_end: row.period_end,
            total_sales_cents: row.total_sales_cents,
            total_fee_cents: row.total_fee_cents,
            transaction_count: row.transaction_count,
            transaction_ids: row.transaction_ids,
            status: row.status.parse()?,
            external_payment_id: row.external_payment_id,
            checkout_url: row.checkout_url,
            failure_reason: row.failure_reason,
            paid_at: row.paid_at,
            retry_count: row.retry_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn is_in_flight_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.constraint() == Some(IN_FLIGHT_INDEX))
}

/// Ledger store over the shared Postgres pool
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Lock the merchant owning `invoice_id` for the rest of the transaction.
///
/// Taken before any invoice row so the lock order matches `create_invoice`.
async fn lock_invoice_merchant(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> BillingResult<Option<Merchant>> {
    let row: Option<MerchantRow> = sqlx::query_as(&format!(
        r#"
        SELECT {MERCHANT_COLUMNS} FROM users
        WHERE id = (SELECT merchant_id FROM invoices WHERE id = $1)
        FOR UPDATE
        "#
    ))
    .bind(invoice_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Merchant::try_from).transpose()
}

async fn write_billing_state(
    conn: &mut PgConnection,
    merchant_id: Uuid,
    state: &BillingState,
    now: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE users
        SET billing_status = $2,
            payment_failed_at = $3,
            grace_period_ends_at = $4,
            last_failed_invoice_id = $5,
            updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(merchant_id)
    .bind(state.status.as_str())
    .bind(state.payment_failed_at)
    .bind(state.grace_period_ends_at)
    .bind(state.last_failed_invoice_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn register_merchant(
        &self,
        merchant: NewMerchant,
        now: OffsetDateTime,
        first_billing_date: OffsetDateTime,
    ) -> BillingResult<Merchant> {
        let inserted: Option<MerchantRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO users
                (id, external_user_id, external_company_id, billing_status,
                 billing_cycle_start, next_billing_date, created_at, updated_at)
            VALUES ($1, $2, $3, 'active', $4, $5, $4, $4)
            ON CONFLICT DO NOTHING
            RETURNING {MERCHANT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&merchant.external_user_id)
        .bind(&merchant.external_company_id)
        .bind(now)
        .bind(first_billing_date)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return row.try_into();
        }

        // Either the company is already registered or the user owns another one
        match self
            .find_merchant_by_company(&merchant.external_company_id)
            .await?
        {
            Some(existing) => Ok(existing),
            None => Err(BillingError::Validation(format!(
                "User {} already owns a registered company",
                merchant.external_user_id
            ))),
        }
    }

    async fn get_merchant(&self, merchant_id: Uuid) -> BillingResult<Option<Merchant>> {
        let row: Option<MerchantRow> =
            sqlx::query_as(&format!("SELECT {MERCHANT_COLUMNS} FROM users WHERE id = $1"))
                .bind(merchant_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Merchant::try_from).transpose()
    }

    async fn find_merchant_by_company(&self, company_id: &str) -> BillingResult<Option<Merchant>> {
        let row: Option<MerchantRow> = sqlx::query_as(&format!(
            "SELECT {MERCHANT_COLUMNS} FROM users WHERE external_company_id = $1"
        ))
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Merchant::try_from).transpose()
    }

    async fn find_merchant_by_user(&self, user_id: &str) -> BillingResult<Option<Merchant>> {
        let row: Option<MerchantRow> = sqlx::query_as(&format!(
            "SELECT {MERCHANT_COLUMNS} FROM users WHERE external_user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Merchant::try_from).transpose()
    }

    async fn merchants_due_for_billing(&self, now: OffsetDateTime) -> BillingResult<Vec<Merchant>> {
        let rows: Vec<MerchantRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MERCHANT_COLUMNS} FROM users
            WHERE next_billing_date <= $1
            ORDER BY next_billing_date ASC
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn merchants_with_expired_grace(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Merchant>> {
        let rows: Vec<MerchantRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MERCHANT_COLUMNS} FROM users
            WHERE billing_status = 'grace_period' AND grace_period_ends_at <= $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn set_payment_method(
        &self,
        merchant_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET payment_method_id = $2, payment_method_connected = TRUE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(merchant_id)
        .bind(payment_method_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_billing_cycle(
        &self,
        merchant_id: Uuid,
        cycle_start: OffsetDateTime,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET billing_cycle_start = $2, next_billing_date = $3, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(merchant_id)
        .bind(cycle_start)
        .bind(next_billing_date)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Merchant {}", merchant_id)));
        }
        Ok(())
    }

    async fn transition_billing_state(
        &self,
        merchant_id: Uuid,
        from: &[BillingStatus],
        next: &BillingState,
    ) -> BillingResult<bool> {
        let from: Vec<&str> = from.iter().map(BillingStatus::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE users
            SET billing_status = $2,
                payment_failed_at = $3,
                grace_period_ends_at = $4,
                last_failed_invoice_id = $5,
                updated_at = NOW()
            WHERE id = $1 AND billing_status = ANY($6)
            "#,
        )
        .bind(merchant_id)
        .bind(next.status.as_str())
        .bind(next.payment_failed_at)
        .bind(next.grace_period_ends_at)
        .bind(next.last_failed_invoice_id)
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_transaction(&self, transaction: NewTransaction) -> BillingResult<Recorded> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<TransactionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO transactions
                (id, merchant_id, external_payment_id, product_id, product_name,
                 sale_amount_cents, fee_amount_cents, currency, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9)
            ON CONFLICT (external_payment_id) DO NOTHING
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(transaction.merchant_id)
        .bind(&transaction.external_payment_id)
        .bind(&transaction.product_id)
        .bind(&transaction.product_name)
        .bind(transaction.sale_amount_cents)
        .bind(transaction.fee_amount_cents)
        .bind(&transaction.currency)
        .bind(transaction.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            let existing = self
                .find_transaction_by_payment_id(&transaction.external_payment_id)
                .await?
                .ok_or_else(|| {
                    BillingError::Internal(format!(
                        "Transaction for payment {} conflicted but was not found",
                        transaction.external_payment_id
                    ))
                })?;
            return Ok(Recorded::Duplicate(existing));
        };

        let updated = sqlx::query(
            r#"
            UPDATE users
            SET total_revenue_generated_cents = total_revenue_generated_cents + $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(transaction.merchant_id)
        .bind(transaction.sale_amount_cents)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(BillingError::NotFound(format!(
                "Merchant {}",
                transaction.merchant_id
            )));
        }

        tx.commit().await?;
        Ok(Recorded::Inserted(row.try_into()?))
    }

    async fn find_transaction_by_payment_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE external_payment_id = $1"
        ))
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn pending_transactions(&self, merchant_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE merchant_id = $1 AND status = 'pending'
            ORDER BY created_at ASC
            "#
        ))
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn recent_transactions(
        &self,
        merchant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE merchant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(merchant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> BillingResult<Invoice> {
        let mut tx = self.pool.begin().await?;

        // Serialise invoice creation per merchant
        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(invoice.merchant_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Err(BillingError::NotFound(format!(
                "Merchant {}",
                invoice.merchant_id
            )));
        }

        let in_flight: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM invoices
            WHERE merchant_id = $1 AND status IN ('pending', 'processing')
            LIMIT 1
            "#,
        )
        .bind(invoice.merchant_id)
        .fetch_optional(&mut *tx)
        .await?;
        if in_flight.is_some() {
            tx.rollback().await?;
            return Err(BillingError::InvoiceInFlight(invoice.merchant_id));
        }

        let (still_pending,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM transactions
            WHERE id = ANY($1) AND merchant_id = $2 AND status = 'pending'
            "#,
        )
        .bind(&invoice.transaction_ids)
        .bind(invoice.merchant_id)
        .fetch_one(&mut *tx)
        .await?;
        if still_pending != invoice.transaction_ids.len() as i64 {
            tx.rollback().await?;
            return Err(BillingError::StaleSnapshot);
        }

        let inserted: Result<InvoiceRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO invoices
                (id, merchant_id, kind, period_start, period_end, total_sales_cents,
                 total_fee_cents, transaction_count, transaction_ids, status, retry_count,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 0, $10, $10)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(invoice.merchant_id)
        .bind(invoice.kind.as_str())
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.total_sales_cents)
        .bind(invoice.total_fee_cents)
        .bind(invoice.transaction_ids.len() as i32)
        .bind(&invoice.transaction_ids)
        .bind(invoice.created_at)
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(e) if is_in_flight_violation(&e) => {
                tx.rollback().await?;
                return Err(BillingError::InvoiceInFlight(invoice.merchant_id));
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;
        row.try_into()
    }

    async fn mark_invoice_processing(
        &self,
        invoice_id: Uuid,
        external_payment_id: Option<&str>,
        checkout_url: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'processing',
                external_payment_id = COALESCE($2, external_payment_id),
                checkout_url = COALESCE($3, checkout_url),
                updated_at = $4
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(invoice_id)
        .bind(external_payment_id)
        .bind(checkout_url)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_invoice_failed(
        &self,
        invoice_id: Uuid,
        reason: &str,
        effect: FailureEffect,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Settled>> {
        let mut tx = self.pool.begin().await?;

        let Some(merchant) = lock_invoice_merchant(&mut *tx, invoice_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            UPDATE invoices
            SET status = 'failed',
                failure_reason = $2,
                retry_count = retry_count + 1,
                updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'processing')
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(reason)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let grace = match effect {
            FailureEffect::EnterGrace(grace_period) => {
                enter_grace(&merchant.billing_state(), invoice_id, now, grace_period)
            }
            FailureEffect::KeepStatus => None,
        };
        if let Some(next) = &grace {
            write_billing_state(&mut *tx, merchant.id, next, now).await?;
        }

        tx.commit().await?;
        Ok(Some(Settled {
            invoice: row.try_into()?,
            status_changed: grace.is_some(),
        }))
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        paid_at: OffsetDateTime,
        next_billing_date: OffsetDateTime,
    ) -> BillingResult<Option<Settled>> {
        let mut tx = self.pool.begin().await?;

        let Some(merchant) = lock_invoice_merchant(&mut *tx, invoice_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            UPDATE invoices
            SET status = 'paid', paid_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'processing'
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(paid_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE transactions
            SET status = 'invoiced', invoice_id = $1
            WHERE id = ANY($2)
            "#,
        )
        .bind(invoice_id)
        .bind(&row.transaction_ids)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE users
            SET billing_cycle_start = $2, next_billing_date = $3, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(merchant.id)
        .bind(paid_at)
        .bind(next_billing_date)
        .execute(&mut *tx)
        .await?;

        let recovered = recover(&merchant.billing_state());
        if let Some(next) = &recovered {
            write_billing_state(&mut *tx, merchant.id, next, paid_at).await?;
        }

        tx.commit().await?;
        Ok(Some(Settled {
            invoice: row.try_into()?,
            status_changed: recovered.is_some(),
        }))
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> =
            sqlx::query_as(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"))
                .bind(invoice_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn find_invoice_by_payment_id(
        &self,
        external_payment_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE external_payment_id = $1"
        ))
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn recent_invoices(&self, merchant_id: Uuid, limit: i64) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE merchant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(merchant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn invoices_in_status_before(
        &self,
        status: InvoiceStatus,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            "#
        ))
        .bind(status.as_str())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn all_invoices(&self) -> BillingResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> =
            sqlx::query_as(&format!("SELECT {INVOICE_COLUMNS} FROM invoices"))
                .fetch_all(&self.pool)
                .await?;
        convert_all(rows)
    }

    async fn invoiced_transactions(&self) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE status = 'invoiced'"
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn all_merchants(&self) -> BillingResult<Vec<Merchant>> {
        let rows: Vec<MerchantRow> = sqlx::query_as(&format!("SELECT {MERCHANT_COLUMNS} FROM users"))
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let stale_before = now - Duration::minutes(WEBHOOK_CLAIM_TIMEOUT_MINUTES);

        // Insert a fresh claim, or take over one that errored or got stuck
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', $3)
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $3,
                error_message = NULL
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < $4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookEventResult,
    ) -> BillingResult<()> {
        let (processing_result, error_message) = match result {
            WebhookEventResult::Success => ("success", None),
            WebhookEventResult::Error(message) => ("error", Some(message)),
        };

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $1, error_message = $2
            WHERE event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
