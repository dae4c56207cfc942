//! Money helpers
//!
//! Amounts are carried as integer cents. Conversions from the provider's
//! decimal currency units happen once, at the webhook boundary.

/// Convert decimal currency units to cents, rounding half away from zero.
///
/// Returns `None` for NaN, infinities and values outside the `i64` range.
pub fn dollars_to_cents(amount: f64) -> Option<i64> {
    if !amount.is_finite() {
        return None;
    }
    let cents = (amount * 100.0).round();
    if cents.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(cents as i64)
}

/// Convert cents to decimal currency units for display.
pub fn cents_to_dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// `round2(amount * rate)` on exact integer arithmetic.
///
/// `basis_points` is the rate in hundredths of a percent (500 = 5%). Rounds
/// half up, which for non-negative amounts matches rounding to the nearest
/// cent.
pub fn percent_of_cents(amount_cents: i64, basis_points: i64) -> i64 {
    let scaled = i128::from(amount_cents) * i128::from(basis_points);
    let rounded = if scaled >= 0 {
        (scaled + 5_000) / 10_000
    } else {
        (scaled - 5_000) / 10_000
    };
    rounded.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

/// Render cents as `$12.34`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn five_percent_rounds_to_nearest_cent() {
        assert_eq!(percent_of_cents(10_000, 500), 500);
        assert_eq!(percent_of_cents(999, 500), 50); // 49.95 -> 50
        assert_eq!(percent_of_cents(989, 500), 49); // 49.45 -> 49
        assert_eq!(percent_of_cents(10, 500), 1); // 0.5 -> 1
        assert_eq!(percent_of_cents(9, 500), 0); // 0.45 -> 0
        assert_eq!(percent_of_cents(0, 500), 0);
    }

    #[test]
    fn fee_matches_round2_for_small_amounts() {
        // round2(sale * 0.05) computed in integer cents for every amount up to $200
        for sale in 0..20_000_i64 {
            let expected = (sale * 5 + 50) / 100;
            assert_eq!(percent_of_cents(sale, 500), expected, "sale = {}", sale);
        }
    }

    #[test]
    fn dollars_convert_at_cent_precision() {
        assert_eq!(dollars_to_cents(19.99), Some(1999));
        assert_eq!(dollars_to_cents(0.1 + 0.2), Some(30));
        assert_eq!(dollars_to_cents(f64::NAN), None);
        assert_eq!(dollars_to_cents(f64::INFINITY), None);
    }

    #[test]
    fn formats_cents() {
        assert_eq!(format_cents(125), "$1.25");
        assert_eq!(format_cents(7), "$0.07");
        assert_eq!(format_cents(-250), "-$2.50");
    }
}
