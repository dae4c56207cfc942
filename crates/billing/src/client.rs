//! Payment provider client
//!
//! The billing core only talks to the provider through [`PaymentProvider`];
//! [`WhopClient`] is the production implementation over the Whop REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_BASE_URL: &str = "https://api.whop.com/api/v1";

/// Metadata key carrying our invoice id on every charge and checkout
pub const INVOICE_METADATA_KEY: &str = "invoice_id";

/// Metadata key carrying the merchant id on setup (vaulting) checkouts
pub const MERCHANT_METADATA_KEY: &str = "merchant_id";

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to payment provider failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("payment provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected payment provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// The provider's own wording, without our status prefix
    pub fn message(&self) -> String {
        match self {
            ProviderError::Http(e) => e.to_string(),
            ProviderError::Rejected { message, .. } => message.clone(),
            ProviderError::InvalidResponse(message) => message.clone(),
        }
    }
}

/// Charge against a vaulted payment method
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub merchant_id: Uuid,
    pub invoice_id: Uuid,
    /// Platform user id of the merchant, who is the payer for fee charges
    pub member_id: String,
    pub payment_method_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
}

/// Acknowledgement that a charge was accepted; the outcome arrives by webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    pub payment_id: String,
}

/// One-time checkout that does not vault the payment method
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
    pub merchant_id: Uuid,
    pub invoice_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodSummary {
    pub id: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
}

/// Display metadata for a product; never affects billing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Start a charge against a saved payment method.
    ///
    /// Returns as soon as the provider accepts the request; success or failure
    /// is reported later through `payment.succeeded` / `payment.failed`.
    async fn charge_saved_method(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, ProviderError>;

    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError>;

    async fn list_payment_methods(
        &self,
        member_id: &str,
    ) -> Result<Vec<PaymentMethodSummary>, ProviderError>;

    async fn product_info(&self, product_id: &str) -> Result<ProductInfo, ProviderError>;
}

/// Whop API configuration
#[derive(Debug, Clone)]
pub struct WhopConfig {
    pub api_key: String,
    pub api_base_url: String,
    pub webhook_secret: String,
    /// Company that collects the platform's own fees
    pub billing_company_id: String,
    pub pay_now_redirect_url: Option<String>,
}

impl WhopConfig {
    pub fn from_env() -> BillingResult<Self> {
        let required = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
        };

        Ok(Self {
            api_key: required("WHOP_API_KEY")?,
            api_base_url: std::env::var("WHOP_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
            webhook_secret: required("WHOP_WEBHOOK_SECRET")?,
            billing_company_id: required("WHOP_BILLING_COMPANY_ID")?,
            pay_now_redirect_url: std::env::var("PAY_NOW_REDIRECT_URL").ok(),
        })
    }
}

/// Whop REST client
#[derive(Clone)]
pub struct WhopClient {
    http: reqwest::Client,
    config: WhopConfig,
}

impl WhopClient {
    pub fn new(config: WhopConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(WhopConfig::from_env()?))
    }

    pub fn config(&self) -> &WhopConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.map(|e| e.message))
                .unwrap_or(body);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutConfigurationResponse {
    id: String,
    purchase_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentMethodList {
    #[serde(default)]
    data: Vec<PaymentMethodItem>,
}

#[derive(Debug, Deserialize)]
struct PaymentMethodItem {
    id: String,
    card: Option<CardDetails>,
}

#[derive(Debug, Deserialize)]
struct CardDetails {
    brand: Option<String>,
    last4: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    id: String,
    title: Option<String>,
}

fn one_time_plan(amount_cents: i64, currency: &str, description: &str) -> serde_json::Value {
    json!({
        "plan_type": "one_time",
        "initial_price": stacker_shared::cents_to_dollars(amount_cents),
        "currency": currency,
        "description": description,
    })
}

#[async_trait]
impl PaymentProvider for WhopClient {
    async fn charge_saved_method(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, ProviderError> {
        let body = json!({
            "company_id": self.config.billing_company_id,
            "member_id": request.member_id,
            "payment_method_id": request.payment_method_id,
            "plan": one_time_plan(request.amount_cents, &request.currency, &request.description),
            "metadata": {
                INVOICE_METADATA_KEY: request.invoice_id.to_string(),
                MERCHANT_METADATA_KEY: request.merchant_id.to_string(),
            },
        });

        let response = self
            .http
            .post(self.url("payments"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let payment: PaymentResponse = Self::read_json(response).await?;

        tracing::info!(
            merchant_id = %request.merchant_id,
            invoice_id = %request.invoice_id,
            payment_id = %payment.id,
            amount_cents = request.amount_cents,
            "Charge accepted by Whop"
        );

        Ok(ChargeReceipt {
            payment_id: payment.id,
        })
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let mut body = json!({
            "company_id": self.config.billing_company_id,
            "plan": one_time_plan(request.amount_cents, &request.currency, &request.description),
            "metadata": {
                INVOICE_METADATA_KEY: request.invoice_id.to_string(),
                MERCHANT_METADATA_KEY: request.merchant_id.to_string(),
            },
        });
        if let Some(redirect_url) = &request.redirect_url {
            body["redirect_url"] = json!(redirect_url);
        }

        let response = self
            .http
            .post(self.url("checkout_configurations"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let checkout: CheckoutConfigurationResponse = Self::read_json(response).await?;

        let url = checkout.purchase_url.ok_or_else(|| {
            ProviderError::InvalidResponse("checkout created without a purchase URL".to_string())
        })?;

        Ok(CheckoutSession {
            id: checkout.id,
            url,
        })
    }

    async fn list_payment_methods(
        &self,
        member_id: &str,
    ) -> Result<Vec<PaymentMethodSummary>, ProviderError> {
        let response = self
            .http
            .get(self.url("payment_methods"))
            .bearer_auth(&self.config.api_key)
            .query(&[("member_id", member_id)])
            .send()
            .await?;
        let list: PaymentMethodList = Self::read_json(response).await?;

        Ok(list
            .data
            .into_iter()
            .map(|item| {
                let (brand, last4) = item
                    .card
                    .map(|c| (c.brand, c.last4))
                    .unwrap_or((None, None));
                PaymentMethodSummary {
                    id: item.id,
                    brand,
                    last4,
                }
            })
            .collect())
    }

    async fn product_info(&self, product_id: &str) -> Result<ProductInfo, ProviderError> {
        let response = self
            .http
            .get(self.url(&format!("products/{}", product_id)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;
        let product: ProductResponse = Self::read_json(response).await?;

        Ok(ProductInfo {
            name: product.title.unwrap_or_else(|| product.id.clone()),
            id: product.id,
        })
    }
}
