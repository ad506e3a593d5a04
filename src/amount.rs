// =============================================================================
// DRIFTBRIDGE v1.3 - Amount Conversions
// =============================================================================
//
// Orders carry amounts as unsigned 64-bit satoshi-equivalents against a
// fixed internal denomination. Wallet RPCs speak floating-point coin units,
// so conversions happen at the boundary.
//
// =============================================================================

use chrono::{DateTime, SecondsFormat, Utc};

/// Internal order denomination (satoshis per coin).
pub const COIN: u64 = 100_000_000;

/// Number of significant post-decimal digits for a denomination.
///
/// Computed by repeated division so that COIN = 10^8 yields 8.
pub fn significant_digits(denomination: u64) -> u32 {
    let mut n = 0;
    let mut i = denomination;
    loop {
        n += 1;
        i /= 10;
        if i <= 1 {
            break;
        }
    }
    n
}

/// Convert an internal amount to coin units.
pub fn value_from_amount(amount: u64) -> f64 {
    amount as f64 / COIN as f64
}

/// Convert coin units to an internal amount, rounding half away from zero.
pub fn amount_from_real(val: f64) -> u64 {
    let d = val * COIN as f64;
    let r = if d > 0.0 { d + 0.5 } else { d - 0.5 };
    r as i64 as u64
}

/// Format an internal amount with full denomination precision.
pub fn string_from_amount(amount: u64) -> String {
    format!(
        "{:.*}",
        significant_digits(COIN) as usize,
        value_from_amount(amount)
    )
}

/// Format a price (coin units) with full denomination precision.
pub fn string_from_price(price: f64, denomination: u64) -> String {
    format!("{:.*}", significant_digits(denomination) as usize, price)
}

/// Check that a decimal coin string does not carry more precision than the
/// denomination supports. Trailing zeros after the decimal point are free.
pub fn valid_coin_string(coin: &str) -> bool {
    let mut seen_point = false;
    let mut n = 0i32;
    let mut zeros = 0i32;
    for c in coin.chars() {
        if !seen_point && c == '.' {
            seen_point = true;
        } else if seen_point {
            n += 1;
            if c == '0' {
                zeros += 1;
            } else {
                zeros = 0;
            }
        }
    }
    n - zeros <= significant_digits(COIN) as i32
}

/// Price of an order expressed as to-amount over from-amount.
pub fn price(from_amount: u64, to_amount: u64) -> f64 {
    if from_amount == 0 {
        return 0.0;
    }
    value_from_amount(to_amount) / value_from_amount(from_amount)
}

// =============================================================================
// Timestamps
// =============================================================================

/// Current UTC time in microseconds since the epoch.
pub fn now_micros() -> u64 {
    Utc::now().timestamp_micros() as u64
}

/// ISO-8601 with milliseconds, used by the order audit log.
pub fn iso8601(micros: u64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp_micros(micros as i64)
        .unwrap_or_else(|| DateTime::from_timestamp_micros(0).unwrap());
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significant_digits() {
        assert_eq!(significant_digits(100_000_000), 8);
        assert_eq!(significant_digits(1_000_000), 6);
        assert_eq!(significant_digits(100), 2);
        assert_eq!(significant_digits(10), 1);
    }

    #[test]
    fn test_amount_round_trip() {
        for n in [0u64, 1, 546, 100_000, COIN, 25 * COIN + 7, 9_007_199_254] {
            assert_eq!(amount_from_real(value_from_amount(n)), n);
        }
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        // 0.5 satoshi rounds up
        assert_eq!(amount_from_real(1.5 / COIN as f64), 2);
        assert_eq!(amount_from_real(2.5000001 / COIN as f64), 3);
    }

    #[test]
    fn test_string_from_amount() {
        assert_eq!(string_from_amount(COIN), "1.00000000");
        assert_eq!(string_from_amount(123_456_789), "1.23456789");
    }

    #[test]
    fn test_valid_coin_string() {
        assert!(valid_coin_string("1"));
        assert!(valid_coin_string("1.0"));
        assert!(valid_coin_string("0.12345678"));
        assert!(valid_coin_string("0.123456780000")); // trailing zeros ignored
        assert!(!valid_coin_string("0.123456789"));
        assert!(valid_coin_string("10.00000000"));
    }

    #[test]
    fn test_iso8601() {
        assert_eq!(iso8601(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(iso8601(1_500_000), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_price() {
        assert_eq!(price(0, COIN), 0.0);
        assert_eq!(price(COIN, 10 * COIN), 10.0);
    }
}
