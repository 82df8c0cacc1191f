//! Utility functions for the ble-central crate.

use std::time::Duration;

/// Exponential backoff delay for a reconnection attempt.
///
/// # Arguments
///
/// * `attempt` - 1-based attempt number
/// * `base` - Delay before the first attempt
/// * `max` - Upper bound on the delay
///
/// # Example
///
/// ```
/// use ble_central::backoff_delay;
/// use std::time::Duration;
///
/// let base = Duration::from_secs(1);
/// let max = Duration::from_secs(30);
/// assert_eq!(backoff_delay(1, base, max), Duration::from_secs(1));
/// assert_eq!(backoff_delay(3, base, max), Duration::from_secs(4));
/// ```
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map(|d| d.min(max))
        .unwrap_or(max)
}

/// Normalize a MAC-style address to upper case with `:` separators.
///
/// Inputs that are not six hex octets are returned unchanged.
///
/// ```
/// use ble_central::normalize_address;
///
/// assert_eq!(normalize_address("aa-bb-cc-dd-ee-ff"), "AA:BB:CC:DD:EE:FF");
/// assert_eq!(normalize_address("not-a-mac"), "not-a-mac");
/// ```
pub fn normalize_address(raw: &str) -> String {
    let octets: Vec<&str> = raw.split([':', '-']).collect();
    let is_mac = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

    if is_mac {
        octets.join(":").to_ascii_uppercase()
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(4, base, max), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(10, base, max), max);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn test_backoff_attempt_zero() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base, Duration::from_secs(5)), base);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("aa:bb:cc:dd:ee:ff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_address("AA:BB:CC:DD:EE:FF"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_address("hci0/dev_AA"), "hci0/dev_AA");
    }
}
