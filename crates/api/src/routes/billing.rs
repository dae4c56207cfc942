//! Merchant billing routes
//!
//! All handlers resolve the merchant from the authenticated Whop user.

use axum::{extract::State, Extension, Json};
use serde::Serialize;
use stacker_billing::{
    BillingOverview, BillingStatus, Merchant, PayNowOutcome, PaymentMethodSummary, RetryOutcome,
};
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct FlowAccessResponse {
    pub allowed: bool,
    pub status: BillingStatus,
}

async fn current_merchant(state: &AppState, user: &AuthUser) -> ApiResult<Merchant> {
    Ok(state.billing.merchant_for_user(&user.user_id).await?)
}

pub async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<BillingOverview>> {
    let merchant = current_merchant(&state, &user).await?;
    let overview = state
        .billing
        .billing_overview(merchant.id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(overview))
}

pub async fn retry(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<RetryOutcome>> {
    let merchant = current_merchant(&state, &user).await?;
    tracing::info!(merchant_id = %merchant.id, "Manual payment retry requested");
    let outcome = state
        .billing
        .manual
        .retry_payment(merchant.id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(outcome))
}

pub async fn pay_now(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<PayNowOutcome>> {
    let merchant = current_merchant(&state, &user).await?;
    tracing::info!(merchant_id = %merchant.id, "Pay-now requested");
    let outcome = state
        .billing
        .manual
        .pay_now(merchant.id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(outcome))
}

/// Whether the merchant's upsell flows may run
pub async fn flow_access(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<FlowAccessResponse>> {
    let merchant = current_merchant(&state, &user).await?;
    let merchant = state
        .billing
        .status
        .evaluate(merchant, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(FlowAccessResponse {
        allowed: merchant.billing_status != BillingStatus::UnpaidLockout,
        status: merchant.billing_status,
    }))
}

pub async fn payment_methods(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<PaymentMethodSummary>>> {
    let merchant = current_merchant(&state, &user).await?;
    Ok(Json(state.billing.payment_methods(merchant.id).await?))
}
