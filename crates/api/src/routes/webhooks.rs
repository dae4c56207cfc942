//! Whop webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use stacker_billing::{
    webhooks::{HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP},
    BillingError, SignatureHeaders, WebhookDisposition,
};
use time::OffsetDateTime;

use crate::{error::ApiResult, state::AppState};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, BillingError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(BillingError::WebhookSignatureInvalid)
}

/// Verify, claim and reconcile one delivery.
///
/// Errors other than 4xx make Whop redeliver; the delivery ledger lets the
/// redelivery through because the failed attempt was recorded as an error.
pub async fn whop(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookDisposition>> {
    let signature = SignatureHeaders {
        id: header(&headers, HEADER_ID)?,
        timestamp: header(&headers, HEADER_TIMESTAMP)?,
        signature: header(&headers, HEADER_SIGNATURE)?,
    };

    let disposition = state
        .billing
        .webhooks
        .handle(signature, &body, OffsetDateTime::now_utc())
        .await
        .inspect_err(|e| tracing::warn!(error = %e, "Webhook rejected"))?;

    Ok(Json(disposition))
}
