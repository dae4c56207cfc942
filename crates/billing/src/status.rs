//! Billing Status State Machine
//!
//! `active -> grace_period -> unpaid_lockout`, with recovery to `active` from
//! either failed state. Lockout is evaluated lazily: an expired grace period
//! only becomes `unpaid_lockout` the next time the merchant's status is read
//! or the billing cycle sweeps it.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{BillingState, BillingStatus, Merchant};
use crate::store::LedgerStore;

/// `active -> grace_period` after a failed invoice. `None` if not active.
pub fn enter_grace(
    state: &BillingState,
    failed_invoice_id: Uuid,
    now: OffsetDateTime,
    grace_period: Duration,
) -> Option<BillingState> {
    if !state.status.can_transition_to(BillingStatus::GracePeriod) {
        return None;
    }
    Some(BillingState {
        status: BillingStatus::GracePeriod,
        payment_failed_at: Some(now),
        grace_period_ends_at: Some(now + grace_period),
        last_failed_invoice_id: Some(failed_invoice_id),
    })
}

/// `grace_period -> unpaid_lockout` once the grace window has ended.
///
/// The grace fields are kept for audit.
pub fn expire_grace(state: &BillingState, now: OffsetDateTime) -> Option<BillingState> {
    if state.status != BillingStatus::GracePeriod {
        return None;
    }
    match state.grace_period_ends_at {
        Some(ends_at) if ends_at <= now => Some(BillingState {
            status: BillingStatus::UnpaidLockout,
            ..state.clone()
        }),
        _ => None,
    }
}

/// `grace_period | unpaid_lockout -> active`, clearing the grace fields
pub fn recover(state: &BillingState) -> Option<BillingState> {
    if !state.status.can_transition_to(BillingStatus::Active) {
        return None;
    }
    Some(BillingState::active())
}

/// Read-side projection of a merchant's billing standing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingStatusView {
    pub status: BillingStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub payment_failed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub last_failed_invoice_id: Option<Uuid>,
    /// Hours left before lockout, only while in the grace period
    pub hours_remaining: Option<f64>,
    pub lockout_eligible: bool,
}

impl BillingStatusView {
    pub fn project(state: &BillingState, now: OffsetDateTime) -> Self {
        let hours_remaining = match (state.status, state.grace_period_ends_at) {
            (BillingStatus::GracePeriod, Some(ends_at)) => {
                Some(((ends_at - now).as_seconds_f64() / 3600.0).max(0.0))
            }
            _ => None,
        };
        let lockout_eligible = state.status != BillingStatus::Active
            && state.grace_period_ends_at.is_some_and(|ends_at| ends_at <= now);

        Self {
            status: state.status,
            payment_failed_at: state.payment_failed_at,
            grace_period_ends_at: state.grace_period_ends_at,
            last_failed_invoice_id: state.last_failed_invoice_id,
            hours_remaining,
            lockout_eligible,
        }
    }
}

/// Store-backed transitions; every write is a compare-and-set on the source states
#[derive(Clone)]
pub struct BillingStateMachine {
    store: Arc<dyn LedgerStore>,
}

impl BillingStateMachine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    async fn load(&self, merchant_id: Uuid) -> BillingResult<Merchant> {
        self.store
            .get_merchant(merchant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Merchant {}", merchant_id)))
    }

    /// Apply lazy grace expiry and return the merchant as it now stands.
    pub async fn evaluate(&self, merchant: Merchant, now: OffsetDateTime) -> BillingResult<Merchant> {
        let Some(next) = expire_grace(&merchant.billing_state(), now) else {
            return Ok(merchant);
        };

        let applied = self
            .store
            .transition_billing_state(merchant.id, &[BillingStatus::GracePeriod], &next)
            .await?;

        if applied {
            tracing::warn!(
                merchant_id = %merchant.id,
                grace_period_ends_at = ?next.grace_period_ends_at,
                "Grace period expired, merchant locked out"
            );
            let mut merchant = merchant;
            merchant.apply_billing_state(next);
            Ok(merchant)
        } else {
            // Someone else moved the merchant first; report what is stored now
            self.load(merchant.id).await
        }
    }

    pub async fn status_view(
        &self,
        merchant: Merchant,
        now: OffsetDateTime,
    ) -> BillingResult<BillingStatusView> {
        let merchant = self.evaluate(merchant, now).await?;
        Ok(BillingStatusView::project(&merchant.billing_state(), now))
    }

    /// Gate for upsell-flow execution: refused only while locked out.
    pub async fn flow_execution_allowed(
        &self,
        merchant: Merchant,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let merchant = self.evaluate(merchant, now).await?;
        Ok(merchant.billing_status != BillingStatus::UnpaidLockout)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::NewMerchant;
    use crate::store::MemoryLedgerStore;

    fn grace() -> Duration {
        Duration::hours(48)
    }

    #[test]
    fn grace_ends_exactly_forty_eight_hours_after_failure() {
        let t = OffsetDateTime::now_utc();
        let invoice_id = Uuid::new_v4();
        let next = enter_grace(&BillingState::active(), invoice_id, t, grace()).unwrap();

        assert_eq!(next.status, BillingStatus::GracePeriod);
        assert_eq!(next.payment_failed_at, Some(t));
        assert_eq!(next.grace_period_ends_at, Some(t + Duration::hours(48)));
        assert_eq!(next.last_failed_invoice_id, Some(invoice_id));
    }

    #[test]
    fn repeated_failure_does_not_restart_grace() {
        let t = OffsetDateTime::now_utc();
        let in_grace = enter_grace(&BillingState::active(), Uuid::new_v4(), t, grace()).unwrap();
        assert!(enter_grace(&in_grace, Uuid::new_v4(), t, grace()).is_none());

        let locked = expire_grace(&in_grace, t + Duration::hours(49)).unwrap();
        assert!(enter_grace(&locked, Uuid::new_v4(), t, grace()).is_none());
    }

    #[test]
    fn active_can_never_expire_into_lockout() {
        let far_future = OffsetDateTime::now_utc() + Duration::days(365);
        assert!(expire_grace(&BillingState::active(), far_future).is_none());
    }

    #[test]
    fn status_view_tracks_remaining_hours() {
        let t = OffsetDateTime::now_utc();
        let state = enter_grace(&BillingState::active(), Uuid::new_v4(), t, grace()).unwrap();

        let view = BillingStatusView::project(&state, t + Duration::hours(47));
        assert_eq!(view.status, BillingStatus::GracePeriod);
        assert!((view.hours_remaining.unwrap() - 1.0).abs() < 1e-9);
        assert!(!view.lockout_eligible);

        let view = BillingStatusView::project(&state, t + Duration::hours(49));
        assert_eq!(view.hours_remaining, Some(0.0));
        assert!(view.lockout_eligible);
    }

    #[test]
    fn recovery_clears_grace_fields() {
        let t = OffsetDateTime::now_utc();
        let state = enter_grace(&BillingState::active(), Uuid::new_v4(), t, grace()).unwrap();
        assert_eq!(recover(&state), Some(BillingState::active()));
        assert!(recover(&BillingState::active()).is_none());
    }

    #[tokio::test]
    async fn lockout_is_applied_when_status_is_read() {
        let store = Arc::new(MemoryLedgerStore::new());
        let t = OffsetDateTime::now_utc();
        let merchant = store
            .register_merchant(
                NewMerchant {
                    external_user_id: "user_sm".to_string(),
                    external_company_id: "biz_sm".to_string(),
                },
                t,
                t + Duration::days(7),
            )
            .await
            .unwrap();
        let machine = BillingStateMachine::new(store.clone());

        let next = enter_grace(&merchant.billing_state(), Uuid::new_v4(), t, grace()).unwrap();
        assert!(store
            .transition_billing_state(merchant.id, &[BillingStatus::Active], &next)
            .await
            .unwrap());
        let merchant = store.get_merchant(merchant.id).await.unwrap().unwrap();

        assert!(machine
            .flow_execution_allowed(merchant.clone(), t + Duration::hours(47))
            .await
            .unwrap());
        assert!(!machine
            .flow_execution_allowed(merchant.clone(), t + Duration::hours(49))
            .await
            .unwrap());

        let stored = store.get_merchant(merchant.id).await.unwrap().unwrap();
        assert_eq!(stored.billing_status, BillingStatus::UnpaidLockout);
    }
}
