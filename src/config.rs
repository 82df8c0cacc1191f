//! Connection manager configuration.

use std::time::Duration;

use crate::ble::advertising::DuplicatePolicy;

/// Tunables for a [`ConnectionManager`](crate::ConnectionManager).
///
/// ```
/// use ble_central::ManagerConfig;
/// use std::time::Duration;
///
/// let config = ManagerConfig::default()
///     .with_request_timeout(Duration::from_secs(5))
///     .with_auto_reconnect(true);
/// assert!(config.auto_reconnect);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Deadline applied to each GATT request, measured from submission.
    pub request_timeout: Duration,
    /// Deadline for a connect attempt to reach `Ready`.
    pub connect_timeout: Duration,
    /// Reconnect after an unexpected link loss.
    pub auto_reconnect: bool,
    /// Maximum reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt; doubled per attempt.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the reconnection backoff.
    pub reconnect_max_delay: Duration,
    /// Duplicate policy for scans started without an explicit filter.
    pub scan_duplicates: DuplicatePolicy,
    /// Capacity of the connection event broadcast channel.
    pub event_capacity: usize,
}

impl ManagerConfig {
    /// Default GATT request timeout (10 seconds).
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default connect timeout (30 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable auto-reconnect.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnection parameters.
    pub fn with_reconnect_params(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_delay = base_delay;
        self
    }

    /// Set the default duplicate policy for unfiltered scans.
    pub fn with_scan_duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.scan_duplicates = policy;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: false,
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            scan_duplicates: DuplicatePolicy::FirstSeen,
            event_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(!config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.scan_duplicates, DuplicatePolicy::FirstSeen);
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfig::default()
            .with_reconnect_params(5, Duration::from_millis(250))
            .with_connect_timeout(Duration::from_secs(2));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }
}
