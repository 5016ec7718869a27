//! Exponential backoff shared by port probing and session retries.

use std::time::Duration;

/// Returns `min(base * multiplier^exponent, cap)`.
///
/// Saturates instead of overflowing for large exponents.
pub fn exponential(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_base() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_secs(30);
        assert_eq!(exponential(base, 0, cap), Duration::from_millis(1000));
        assert_eq!(exponential(base, 1, cap), Duration::from_millis(2000));
        assert_eq!(exponential(base, 3, cap), Duration::from_millis(8000));
    }

    #[test]
    fn test_caps_at_maximum() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_secs(30);
        assert_eq!(exponential(base, 5, cap), cap);
        assert_eq!(exponential(base, 64, cap), cap);
    }
}
