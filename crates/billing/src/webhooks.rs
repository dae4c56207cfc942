//! Whop webhook handling
//!
//! Deliveries are signed with the Standard Webhooks scheme and parsed once into
//! [`WebhookEvent`]. Anything the billing core does not understand is rejected
//! here instead of being picked apart for optional fields further down.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{INVOICE_METADATA_KEY, MERCHANT_METADATA_KEY};
use crate::error::{BillingError, BillingResult};
use crate::reconciliation::{ReconcileOutcome, Reconciler};
use crate::store::{LedgerStore, WebhookEventResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew accepted on `webhook-timestamp`
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const HEADER_ID: &str = "webhook-id";
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";
pub const HEADER_SIGNATURE: &str = "webhook-signature";

/// The three signature headers of one delivery
#[derive(Debug, Clone, Copy)]
pub struct SignatureHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

/// Standard Webhooks HMAC-SHA256 verifier
#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
}

impl WebhookVerifier {
    /// Secrets prefixed `whsec_` carry a base64 key; anything else is used as raw bytes.
    pub fn new(secret: &str) -> BillingResult<Self> {
        let key = match secret.strip_prefix("whsec_") {
            Some(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?,
            None => secret.as_bytes().to_vec(),
        };
        if key.is_empty() {
            return Err(BillingError::Config("Webhook secret is empty".to_string()));
        }
        Ok(Self { key })
    }

    fn mac(&self, id: &str, timestamp: &str, body: &[u8]) -> BillingResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| BillingError::Internal(format!("HMAC key rejected: {}", e)))?;
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// `v1,<base64>` signature for a delivery
    pub fn sign(&self, id: &str, timestamp: &str, body: &[u8]) -> BillingResult<String> {
        let digest = self.mac(id, timestamp, body)?.finalize().into_bytes();
        Ok(format!("v1,{}", BASE64.encode(digest)))
    }

    pub fn verify(
        &self,
        headers: SignatureHeaders<'_>,
        body: &[u8],
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let timestamp: i64 = headers.timestamp.trim().parse().map_err(|_| {
            tracing::warn!(timestamp = headers.timestamp, "Unparseable webhook timestamp");
            BillingError::WebhookSignatureInvalid
        })?;

        let skew = (now.unix_timestamp() - timestamp).abs();
        if skew > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                webhook_id = headers.id,
                skew_secs = skew,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = self
            .mac(headers.id, headers.timestamp.trim(), body)?
            .finalize()
            .into_bytes();

        // The header may carry several space-separated signatures during key rotation
        let matched = headers
            .signature
            .split_whitespace()
            .filter_map(|entry| entry.split_once(','))
            .filter(|(version, _)| *version == "v1")
            .filter_map(|(_, encoded)| BASE64.decode(encoded).ok())
            .any(|candidate| bool::from(candidate.as_slice().ct_eq(expected.as_slice())));

        if !matched {
            tracing::warn!(webhook_id = headers.id, "Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        Ok(())
    }
}

/// A completed payment, either a merchant sale or one of our own fee charges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSucceeded {
    pub payment_id: String,
    pub company_id: String,
    pub amount_cents: i64,
    pub currency: String,
    /// Absent on the platform's own fee charges
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    /// Our invoice id, present on fee charges and pay-now checkouts
    pub invoice_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentFailed {
    pub payment_id: String,
    pub company_id: String,
    pub failure_reason: String,
    pub invoice_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMethodVaulted {
    pub merchant_id: Uuid,
    pub payment_method_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
    PaymentMethodVaulted(PaymentMethodVaulted),
}

/// A verified, fully parsed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub kind: WebhookEventKind,
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct EntityRef {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct PaymentData {
    id: String,
    company: EntityRef,
    #[serde(default)]
    product: Option<EntityRef>,
    #[serde(default)]
    total: Option<f64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    failure_message: Option<String>,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct SetupIntentData {
    payment_method: EntityRef,
    #[serde(default)]
    metadata: Option<HashMap<String, serde_json::Value>>,
}

fn metadata_str<'a>(
    metadata: &'a Option<HashMap<String, serde_json::Value>>,
    key: &str,
) -> Option<&'a str> {
    metadata.as_ref()?.get(key)?.as_str()
}

/// Merchants may put their own `invoice_id` on sales; only a UUID can be ours
fn metadata_invoice_id(metadata: &Option<HashMap<String, serde_json::Value>>) -> Option<Uuid> {
    metadata_str(metadata, INVOICE_METADATA_KEY).and_then(|raw| Uuid::parse_str(raw).ok())
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        let envelope: Envelope = serde_json::from_slice(body)?;

        let kind = match envelope.event_type.as_str() {
            "payment.succeeded" => {
                let data: PaymentData = serde_json::from_value(envelope.data)?;
                let total = data.total.ok_or_else(|| {
                    BillingError::WebhookPayload("payment.succeeded without total".to_string())
                })?;
                let amount_cents = stacker_shared::dollars_to_cents(total).ok_or_else(|| {
                    BillingError::WebhookPayload(format!("invalid payment total: {}", total))
                })?;
                let invoice_id = metadata_invoice_id(&data.metadata);
                let (product_id, product_name) = match data.product {
                    Some(product) => (Some(product.id), product.title),
                    None => (None, None),
                };

                WebhookEventKind::PaymentSucceeded(PaymentSucceeded {
                    payment_id: data.id,
                    company_id: data.company.id,
                    amount_cents,
                    currency: data
                        .currency
                        .filter(|c| !c.trim().is_empty())
                        .unwrap_or_else(|| "usd".to_string()),
                    product_id,
                    product_name,
                    invoice_id,
                })
            }
            "payment.failed" => {
                let data: PaymentData = serde_json::from_value(envelope.data)?;
                let invoice_id = metadata_invoice_id(&data.metadata);
                WebhookEventKind::PaymentFailed(PaymentFailed {
                    payment_id: data.id,
                    company_id: data.company.id,
                    failure_reason: data
                        .failure_message
                        .unwrap_or_else(|| "Payment failed".to_string()),
                    invoice_id,
                })
            }
            "setup_intent.succeeded" => {
                let data: SetupIntentData = serde_json::from_value(envelope.data)?;
                let raw = metadata_str(&data.metadata, MERCHANT_METADATA_KEY).ok_or_else(|| {
                    BillingError::WebhookPayload("setup intent without merchant_id".to_string())
                })?;
                let merchant_id = Uuid::parse_str(raw).map_err(|_| {
                    BillingError::WebhookPayload(format!("invalid merchant_id: {}", raw))
                })?;
                WebhookEventKind::PaymentMethodVaulted(PaymentMethodVaulted {
                    merchant_id,
                    payment_method_id: data.payment_method.id,
                })
            }
            other => return Err(BillingError::WebhookEventNotSupported(other.to_string())),
        };

        Ok(Self {
            id: envelope.id,
            event_type: envelope.event_type,
            kind,
        })
    }
}

/// What the endpoint did with a delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookDisposition {
    Processed { outcome: ReconcileOutcome },
    /// Already processed, or another worker holds a fresh claim
    AlreadyHandled,
}

/// Verify, claim, dispatch and record one delivery
pub struct WebhookHandler {
    verifier: WebhookVerifier,
    reconciler: Arc<Reconciler>,
    store: Arc<dyn LedgerStore>,
}

impl WebhookHandler {
    pub fn new(
        verifier: WebhookVerifier,
        reconciler: Arc<Reconciler>,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            verifier,
            reconciler,
            store,
        }
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    pub async fn handle(
        &self,
        headers: SignatureHeaders<'_>,
        body: &[u8],
        now: OffsetDateTime,
    ) -> BillingResult<WebhookDisposition> {
        self.verifier.verify(headers, body, now)?;
        let event = WebhookEvent::parse(body)?;

        if !self
            .store
            .claim_webhook_event(&event.id, &event.event_type, now)
            .await?
        {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook already processed or in progress, skipping"
            );
            return Ok(WebhookDisposition::AlreadyHandled);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.dispatch(&event, now).await;

        let record = match &result {
            Ok(_) => WebhookEventResult::Success,
            Err(e) => WebhookEventResult::Error(e.to_string()),
        };
        if let Err(e) = self.store.complete_webhook_event(&event.id, record).await {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        result.map(|outcome| WebhookDisposition::Processed { outcome })
    }

    async fn dispatch(
        &self,
        event: &WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        match &event.kind {
            WebhookEventKind::PaymentSucceeded(payment) => {
                self.reconciler.on_payment_succeeded(payment, now).await
            }
            WebhookEventKind::PaymentFailed(payment) => {
                self.reconciler.on_payment_failed(payment, now).await
            }
            WebhookEventKind::PaymentMethodVaulted(vaulted) => {
                self.reconciler
                    .on_payment_method_vaulted(vaulted.merchant_id, &vaulted.payment_method_id)
                    .await
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

    fn headers<'a>(id: &'a str, ts: &'a str, sig: &'a str) -> SignatureHeaders<'a> {
        SignatureHeaders {
            id,
            timestamp: ts,
            signature: sig,
        }
    }

    #[test]
    fn accepts_own_signature() {
        let verifier = WebhookVerifier::new(SECRET).unwrap();
        let now = OffsetDateTime::now_utc();
        let ts = now.unix_timestamp().to_string();
        let body = br#"{"id":"evt_1"}"#;
        let sig = verifier.sign("msg_1", &ts, body).unwrap();

        assert!(verifier.verify(headers("msg_1", &ts, &sig), body, now).is_ok());

        // Rotated keys: any matching entry is enough
        let rotated = format!("v1,bm90LXRoZS1zaWduYXR1cmU= {}", sig);
        assert!(verifier.verify(headers("msg_1", &ts, &rotated), body, now).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_stale_timestamp() {
        let verifier = WebhookVerifier::new(SECRET).unwrap();
        let now = OffsetDateTime::now_utc();
        let ts = now.unix_timestamp().to_string();
        let sig = verifier.sign("msg_1", &ts, b"original").unwrap();

        let err = verifier
            .verify(headers("msg_1", &ts, &sig), b"tampered", now)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        let old = (now.unix_timestamp() - 301).to_string();
        let sig = verifier.sign("msg_1", &old, b"original").unwrap();
        let err = verifier
            .verify(headers("msg_1", &old, &sig), b"original", now)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn raw_secret_is_used_verbatim() {
        let raw = WebhookVerifier::new("plain-secret").unwrap();
        let encoded = WebhookVerifier::new(SECRET).unwrap();
        let sig_raw = raw.sign("id", "1", b"x").unwrap();
        let sig_encoded = encoded.sign("id", "1", b"x").unwrap();
        assert_ne!(sig_raw, sig_encoded);
        assert!(WebhookVerifier::new("whsec_!!!").is_err());
    }

    #[test]
    fn parses_merchant_sale_in_cents() {
        let body = json!({
            "id": "evt_sale",
            "type": "payment.succeeded",
            "data": {
                "id": "pay_123",
                "company": { "id": "biz_merchant" },
                "product": { "id": "prod_1", "title": "Masterclass" },
                "total": 19.99,
                "currency": "usd",
                "metadata": { "invoice_id": "their-own-reference" }
            }
        });
        let event = WebhookEvent::parse(body.to_string().as_bytes()).unwrap();

        assert_eq!(event.id, "evt_sale");
        let WebhookEventKind::PaymentSucceeded(payment) = event.kind else {
            panic!("expected payment.succeeded");
        };
        assert_eq!(payment.amount_cents, 1999);
        assert_eq!(payment.product_name.as_deref(), Some("Masterclass"));
        assert_eq!(payment.invoice_id, None);
    }

    #[test]
    fn parses_platform_fee_payment_without_product() {
        let invoice_id = Uuid::new_v4();
        let body = json!({
            "id": "evt_fee",
            "type": "payment.succeeded",
            "data": {
                "id": "pay_fee_1",
                "company": { "id": "biz_platform" },
                "total": 1.25,
                "currency": "usd",
                "metadata": { "invoice_id": invoice_id.to_string() }
            }
        });
        let event = WebhookEvent::parse(body.to_string().as_bytes()).unwrap();

        let WebhookEventKind::PaymentSucceeded(payment) = event.kind else {
            panic!("expected payment.succeeded");
        };
        assert_eq!(payment.amount_cents, 125);
        assert_eq!(payment.product_id, None);
        assert_eq!(payment.invoice_id, Some(invoice_id));
    }

    #[test]
    fn parses_setup_intent_and_failure() {
        let merchant_id = Uuid::new_v4();
        let body = json!({
            "id": "evt_setup",
            "type": "setup_intent.succeeded",
            "data": {
                "id": "sint_1",
                "payment_method": { "id": "pm_9" },
                "metadata": { "merchant_id": merchant_id.to_string() }
            }
        });
        let event = WebhookEvent::parse(body.to_string().as_bytes()).unwrap();
        assert_eq!(
            event.kind,
            WebhookEventKind::PaymentMethodVaulted(PaymentMethodVaulted {
                merchant_id,
                payment_method_id: "pm_9".to_string(),
            })
        );

        let invoice_id = Uuid::new_v4();
        let body = json!({
            "id": "evt_fail",
            "type": "payment.failed",
            "data": {
                "id": "pay_fee",
                "company": { "id": "biz_platform" },
                "failure_message": "card_declined",
                "metadata": { "invoice_id": invoice_id.to_string() }
            }
        });
        let event = WebhookEvent::parse(body.to_string().as_bytes()).unwrap();
        let WebhookEventKind::PaymentFailed(failed) = event.kind else {
            panic!("expected payment.failed");
        };
        assert_eq!(failed.failure_reason, "card_declined");
        assert_eq!(failed.invoice_id, Some(invoice_id));
    }

    #[test]
    fn rejects_unknown_and_malformed_events() {
        let unknown = json!({ "id": "evt", "type": "membership.went_valid", "data": {} });
        let err = WebhookEvent::parse(unknown.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, BillingError::WebhookEventNotSupported(t) if t == "membership.went_valid"));

        let no_company = json!({
            "id": "evt",
            "type": "payment.succeeded",
            "data": { "id": "pay_1", "total": 1.0, "product": { "id": "prod" } }
        });
        let err = WebhookEvent::parse(no_company.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayload(_)));

        let err = WebhookEvent::parse(b"not json").unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayload(_)));
    }
}
