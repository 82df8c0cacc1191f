// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-central
//!
//! A vendor-neutral Bluetooth Low Energy central connection manager.
//!
//! The library sits between application code and the host BLE stack and
//! takes care of the parts platform APIs leave to the caller:
//!
//! - **Scanning**: filtered scan sessions with first-seen de-duplication
//! - **Connection lifecycle**: an explicit state machine per peripheral,
//!   with optional bounded auto-reconnect
//! - **GATT serialization**: one request in flight per link, strict FIFO
//!   order and a deadline on every request
//! - **Error taxonomy**: platform error codes are preserved, never swallowed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_central::{ConnectionManager, ManagerConfig, Result, HEART_RATE_MEASUREMENT_UUID};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = ConnectionManager::with_default_adapter(ManagerConfig::default()).await?;
//!
//!     // Scan for a few seconds and pick the closest peripheral
//!     let scan = manager.start_scan(None).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     manager.stop_scan(scan).await?;
//!
//!     if let Some(nearest) = manager.nearest() {
//!         let connection = manager.connect(nearest.address).await?;
//!         let mut heart_rate = connection.subscribe(HEART_RATE_MEASUREMENT_UUID).await?;
//!
//!         while let Some(value) = heart_rate.recv().await {
//!             println!("Heart rate measurement: {:02X?}", value);
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Custom backends
//!
//! [`ConnectionManager::new`] accepts any [`AdapterGateway`] together with
//! the receiving half of its event channel, so the core can run over a
//! different host stack or a simulated radio in tests.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Hardware addresses are hidden, so
//! peripherals are identified by their platform UUID instead.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod utils;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use connection::{ConnectionHandle, ConnectionStatus, NotificationStream};
pub use connection_manager::{CallbackHandle, ConnectionManager};
pub use error::{Error, Result};
pub use utils::{backoff_delay, normalize_address};

// Re-export commonly used types from submodules
pub use ble::advertising::{AdvertisementRecord, DuplicatePolicy, ScanFilter};
pub use ble::characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor, ServiceTable, WriteType,
};
pub use ble::connection::{ConnectionEvent, ConnectionState};
pub use ble::gateway::{
    event_channel, AdapterGateway, GatewayError, GatewayEvent, GatewayEventReceiver,
    GatewayEventSender, GatewayResult, RequestKind,
};
pub use ble::peripheral::{LinkHandle, PeripheralAddress};
pub use ble::platform::BtleplugGateway;
pub use ble::scanner::{AdvertisementStream, ScanHandle, ScanState};
pub use ble::uuids::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<ConnectionManager>();
        let _ = std::any::TypeId::of::<ConnectionHandle>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ManagerConfig>();
        let _ = std::any::TypeId::of::<AdvertisementRecord>();
        let _ = std::any::TypeId::of::<ServiceTable>();
        let _ = std::any::TypeId::of::<BtleplugGateway>();
    }

    #[test]
    fn test_address_normalization() {
        assert_eq!(normalize_address("aa:bb:cc:dd:ee:ff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            PeripheralAddress::new("aa:bb:cc:dd:ee:ff"),
            PeripheralAddress::from("AA:BB:CC:DD:EE:FF")
        );
    }
}
