//! Scripted payment provider for tests

use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{
    ChargeReceipt, ChargeRequest, CheckoutRequest, CheckoutSession, PaymentMethodSummary,
    PaymentProvider, ProductInfo, ProviderError,
};

#[derive(Default)]
struct Calls {
    charges: Vec<ChargeRequest>,
    checkouts: Vec<CheckoutRequest>,
    fail_next_charge: Option<String>,
    fail_next_checkout: Option<String>,
}

/// Accepts every request unless told to reject the next one.
///
/// Payment ids are `pay_fee_<n>` and checkout ids `chk_<n>`, counting from 1.
#[derive(Default)]
pub struct MockPaymentProvider {
    calls: Mutex<Calls>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Calls> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn fail_next_charge(&self, message: &str) {
        self.lock().fail_next_charge = Some(message.to_string());
    }

    pub fn fail_next_checkout(&self, message: &str) {
        self.lock().fail_next_checkout = Some(message.to_string());
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.lock().charges.clone()
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        self.lock().checkouts.clone()
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn charge_saved_method(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, ProviderError> {
        let mut calls = self.lock();
        calls.charges.push(request.clone());
        if let Some(message) = calls.fail_next_charge.take() {
            return Err(ProviderError::Rejected {
                status: 402,
                message,
            });
        }
        Ok(ChargeReceipt {
            payment_id: format!("pay_fee_{}", calls.charges.len()),
        })
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let mut calls = self.lock();
        calls.checkouts.push(request.clone());
        if let Some(message) = calls.fail_next_checkout.take() {
            return Err(ProviderError::Rejected {
                status: 422,
                message,
            });
        }
        let n = calls.checkouts.len();
        Ok(CheckoutSession {
            id: format!("chk_{}", n),
            url: format!("https://whop.com/checkout/chk_{}", n),
        })
    }

    async fn list_payment_methods(
        &self,
        _member_id: &str,
    ) -> Result<Vec<PaymentMethodSummary>, ProviderError> {
        Ok(vec![PaymentMethodSummary {
            id: "pm_test".to_string(),
            brand: Some("visa".to_string()),
            last4: Some("4242".to_string()),
        }])
    }

    async fn product_info(&self, product_id: &str) -> Result<ProductInfo, ProviderError> {
        Ok(ProductInfo {
            id: product_id.to_string(),
            name: format!("Product {}", product_id),
        })
    }
}
