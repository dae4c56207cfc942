//! Billing policy constants
//!
//! Defaults mirror the production policy; every knob can be overridden from the
//! environment for staging or tests.

use time::Duration;

/// Platform fee on every tracked sale, in basis points (5%)
pub const FEE_RATE_BPS: i64 = 500;

/// Scheduled cycles never charge less than this; smaller balances roll over
pub const MINIMUM_FEE_TO_CHARGE_CENTS: i64 = 100;

/// Floor for user-initiated pay-now checkouts (the provider's own minimum)
pub const PAY_NOW_MINIMUM_CENTS: i64 = 50;

pub const BILLING_INTERVAL_DAYS: i64 = 7;

pub const GRACE_PERIOD_HOURS: i64 = 48;

/// An unpaid pay-now checkout may be superseded by another charge after this
pub const PAY_NOW_CHECKOUT_TTL_HOURS: i64 = 24;

/// Processing invoices older than this are reported as stuck
pub const STALE_PROCESSING_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct BillingPolicy {
    pub fee_rate_bps: i64,
    pub minimum_charge_cents: i64,
    pub pay_now_minimum_cents: i64,
    pub billing_interval: Duration,
    pub grace_period: Duration,
    pub pay_now_checkout_ttl: Duration,
    pub stale_processing_after: Duration,
    /// Currency the platform bills merchants in
    pub currency: String,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            fee_rate_bps: FEE_RATE_BPS,
            minimum_charge_cents: MINIMUM_FEE_TO_CHARGE_CENTS,
            pay_now_minimum_cents: PAY_NOW_MINIMUM_CENTS,
            billing_interval: Duration::days(BILLING_INTERVAL_DAYS),
            grace_period: Duration::hours(GRACE_PERIOD_HOURS),
            pay_now_checkout_ttl: Duration::hours(PAY_NOW_CHECKOUT_TTL_HOURS),
            stale_processing_after: Duration::hours(STALE_PROCESSING_HOURS),
            currency: "usd".to_string(),
        }
    }
}

impl BillingPolicy {
    /// Load policy from environment or use defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            fee_rate_bps: env_parse("BILLING_FEE_RATE_BPS").unwrap_or(defaults.fee_rate_bps),
            minimum_charge_cents: env_parse("BILLING_MINIMUM_CHARGE_CENTS")
                .unwrap_or(defaults.minimum_charge_cents),
            pay_now_minimum_cents: env_parse("BILLING_PAY_NOW_MINIMUM_CENTS")
                .unwrap_or(defaults.pay_now_minimum_cents),
            billing_interval: defaults.billing_interval,
            grace_period: defaults.grace_period,
            pay_now_checkout_ttl: defaults.pay_now_checkout_ttl,
            stale_processing_after: defaults.stale_processing_after,
            currency: std::env::var("BILLING_CURRENCY")
                .ok()
                .filter(|c| !c.trim().is_empty())
                .map(|c| c.trim().to_lowercase())
                .unwrap_or(defaults.currency),
        }
    }

    /// Fee owed on a sale, `round2(sale * rate)` in cents
    pub fn fee_for_sale(&self, sale_amount_cents: i64) -> i64 {
        stacker_shared::percent_of_cents(sale_amount_cents, self.fee_rate_bps)
    }
}

fn env_parse(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fee_is_five_percent() {
        let policy = BillingPolicy::default();
        assert_eq!(policy.fee_for_sale(2_000), 100);
        assert_eq!(policy.fee_for_sale(1_999), 100);
        assert_eq!(policy.fee_for_sale(0), 0);
    }

    #[test]
    fn pay_now_floor_is_below_scheduled_minimum() {
        let policy = BillingPolicy::default();
        assert!(policy.pay_now_minimum_cents < policy.minimum_charge_cents);
        assert_eq!(policy.grace_period, Duration::hours(48));
        assert_eq!(policy.billing_interval, Duration::days(7));
    }
}
