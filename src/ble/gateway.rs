//! Adapter gateway: the capability set consumed from the host BLE stack.
//!
//! Every operation only *initiates* work on the radio. Completions arrive
//! later as [`GatewayEvent`]s on the channel handed to the
//! [`ConnectionManager`](crate::ConnectionManager), mirroring how platform
//! stacks deliver GATT callbacks.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::advertising::{AdvertisementRecord, ScanFilter};
use crate::ble::characteristics::{ServiceTable, WriteType};
use crate::ble::peripheral::{LinkHandle, PeripheralAddress};

/// Failure reported by the gateway, carrying the platform code verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    /// Platform error code.
    pub code: i32,
    /// Human readable description from the platform.
    pub message: String,
}

impl GatewayError {
    /// Create a gateway error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for GatewayError {}

/// Result type of gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Kind of a GATT request, used to correlate completions.
///
/// Platform callbacks carry no request id, so a completion is matched to the
/// in-flight request by characteristic UUID plus kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RequestKind {
    /// Characteristic read.
    Read,
    /// Characteristic write.
    Write,
    /// Enable notifications/indications (CCCD write).
    Subscribe,
    /// Disable notifications/indications (CCCD write).
    Unsubscribe,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// Asynchronous event delivered by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// An advertisement was observed while scanning.
    Advertisement(AdvertisementRecord),
    /// The radio aborted the active scan.
    ScanFailed {
        /// Platform error code.
        code: i32,
    },
    /// A link changed state. `connected == false` after a successful open
    /// means the link was lost or closed; before it means the open failed.
    ConnectionStateChanged {
        /// The link.
        link: LinkHandle,
        /// Whether the link is now up.
        connected: bool,
        /// Platform status code (0 on success).
        code: i32,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// The link.
        link: LinkHandle,
        /// The discovered table, or the platform error code.
        result: std::result::Result<ServiceTable, i32>,
    },
    /// A read/write/set-notify completed.
    CharacteristicResult {
        /// The link.
        link: LinkHandle,
        /// Target characteristic.
        characteristic: Uuid,
        /// Which operation completed.
        kind: RequestKind,
        /// The value (empty for writes) or the platform status code.
        result: std::result::Result<Vec<u8>, i32>,
    },
    /// A notification or indication arrived.
    CharacteristicChanged {
        /// The link.
        link: LinkHandle,
        /// Source characteristic.
        characteristic: Uuid,
        /// The pushed value.
        value: Vec<u8>,
    },
}

impl GatewayEvent {
    /// The peripheral this event belongs to, if it is link-scoped.
    pub fn address(&self) -> Option<&PeripheralAddress> {
        match self {
            Self::Advertisement(_) | Self::ScanFailed { .. } => None,
            Self::ConnectionStateChanged { link, .. }
            | Self::ServicesDiscovered { link, .. }
            | Self::CharacteristicResult { link, .. }
            | Self::CharacteristicChanged { link, .. } => Some(&link.address),
        }
    }
}

/// Sending half of the gateway event channel.
pub type GatewayEventSender = mpsc::UnboundedSender<GatewayEvent>;
/// Receiving half of the gateway event channel.
pub type GatewayEventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

/// Create a gateway event channel.
pub fn event_channel() -> (GatewayEventSender, GatewayEventReceiver) {
    mpsc::unbounded_channel()
}

/// Capability interface over the host BLE radio.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdapterGateway: Send + Sync {
    /// Start scanning. Advertisements arrive as [`GatewayEvent::Advertisement`].
    async fn scan_start(&self, filter: &ScanFilter) -> GatewayResult<()>;

    /// Stop scanning.
    async fn scan_stop(&self) -> GatewayResult<()>;

    /// Begin opening a GATT link. Completion arrives as
    /// [`GatewayEvent::ConnectionStateChanged`].
    async fn gatt_open(&self, address: &PeripheralAddress) -> GatewayResult<LinkHandle>;

    /// Close a GATT link and release its resources.
    async fn gatt_close(&self, link: &LinkHandle) -> GatewayResult<()>;

    /// Begin service discovery. Completion arrives as
    /// [`GatewayEvent::ServicesDiscovered`].
    async fn discover_services(&self, link: &LinkHandle) -> GatewayResult<()>;

    /// Begin a characteristic read.
    async fn gatt_read(&self, link: &LinkHandle, characteristic: Uuid) -> GatewayResult<()>;

    /// Begin a characteristic write.
    async fn gatt_write(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> GatewayResult<()>;

    /// Begin enabling or disabling notifications (CCCD write).
    async fn gatt_set_notify(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> GatewayResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_address() {
        let link = LinkHandle::new(1, "AA:BB:CC:DD:EE:FF".into());
        let event = GatewayEvent::ConnectionStateChanged {
            link: link.clone(),
            connected: true,
            code: 0,
        };
        assert_eq!(event.address(), Some(&link.address));
        assert_eq!(GatewayEvent::ScanFailed { code: 2 }.address(), None);
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::new(133, "GATT_ERROR");
        assert_eq!(err.to_string(), "GATT_ERROR (code 133)");
    }
}
