//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use stacker_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => match e {
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::InvoiceInFlight(_) | BillingError::StaleSnapshot => {
                    StatusCode::CONFLICT
                }
                BillingError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
                BillingError::PaymentProvider(_) => StatusCode::BAD_GATEWAY,
                e if e.is_client_error() => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Billing(e) => match e {
                BillingError::NotFound(_) => "not_found",
                BillingError::Validation(_) => "validation_error",
                BillingError::NoPaymentMethod => "no_payment_method",
                BillingError::BelowMinimum { .. } => "below_minimum",
                BillingError::InvoiceInFlight(_) => "invoice_in_flight",
                BillingError::StaleSnapshot => "conflict",
                BillingError::PaymentProvider(_) => "payment_provider_error",
                BillingError::WebhookSignatureInvalid => "invalid_signature",
                BillingError::WebhookPayload(_) => "invalid_payload",
                BillingError::WebhookEventNotSupported(_) => "unsupported_event",
                BillingError::Config(_)
                | BillingError::Database(_)
                | BillingError::Internal(_) => "internal_error",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_billing_error_status_mapping() {
        let cases = [
            (BillingError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::NoPaymentMethod, StatusCode::BAD_REQUEST),
            (
                BillingError::BelowMinimum {
                    total_fee_cents: 30,
                    minimum_cents: 50,
                },
                StatusCode::BAD_REQUEST,
            ),
            (BillingError::InvoiceInFlight(Uuid::nil()), StatusCode::CONFLICT),
            (BillingError::WebhookSignatureInvalid, StatusCode::UNAUTHORIZED),
            (BillingError::WebhookPayload("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::PaymentProvider("declined".into()), StatusCode::BAD_GATEWAY),
            (BillingError::Database("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status_code(), expected);
        }
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let response = ApiError::from(BillingError::Database("password=hunter2".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_provider_message_prefixed_once() {
        let response = ApiError::from(BillingError::PaymentProvider("card_declined".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "payment_provider_error");
        assert_eq!(body["error"]["message"], "Payment provider error: card_declined");
    }
}
