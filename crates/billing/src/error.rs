//! Billing error types

use uuid::Uuid;

use crate::client::ProviderError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Merchant has no saved payment method")]
    NoPaymentMethod,

    #[error("Pending fees of {total_fee_cents} cents are below the {minimum_cents} cent minimum")]
    BelowMinimum {
        total_fee_cents: i64,
        minimum_cents: i64,
    },

    #[error("Merchant {0} already has an invoice awaiting payment")]
    InvoiceInFlight(Uuid),

    #[error("Pending transactions changed while building the invoice")]
    StaleSnapshot,

    #[error("Payment provider error: {0}")]
    PaymentProvider(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors the caller can fix by changing the request
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::Validation(_)
                | BillingError::NoPaymentMethod
                | BillingError::BelowMinimum { .. }
                | BillingError::WebhookPayload(_)
                | BillingError::WebhookEventNotSupported(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<ProviderError> for BillingError {
    fn from(e: ProviderError) -> Self {
        BillingError::PaymentProvider(e.message())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::WebhookPayload(e.to_string())
    }
}
