//! Merchant registration

use axum::{extract::State, Extension, Json};
use serde::Deserialize;
use stacker_billing::{Merchant, NewMerchant};
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct RegisterMerchantRequest {
    pub company_id: String,
}

/// Register the calling user's company; repeat calls return the same merchant
pub async fn register(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<RegisterMerchantRequest>,
) -> ApiResult<Json<Merchant>> {
    let merchant = state
        .billing
        .register_merchant(
            NewMerchant {
                external_user_id: user.user_id,
                external_company_id: body.company_id,
            },
            OffsetDateTime::now_utc(),
        )
        .await?;
    Ok(Json(merchant))
}
