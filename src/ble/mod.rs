//! BLE building blocks.
//!
//! Leaf types (addresses, advertisements, service tables, UUIDs), the
//! adapter gateway interface with its btleplug backend, and the pure pieces
//! of connection handling: scan sessions, the connection state machine and
//! the GATT operation queue.

pub mod advertising;
pub mod characteristics;
pub mod connection;
pub mod gateway;
pub mod peripheral;
pub mod platform;
pub mod queue;
pub mod scanner;
pub mod uuids;

pub use advertising::{AdvertisementRecord, DuplicatePolicy, ScanFilter};
pub use characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor, ServiceTable, WriteType,
};
pub use connection::{ConnectionEvent, ConnectionState, ReconnectPolicy, StateMachine};
pub use gateway::{AdapterGateway, GatewayError, GatewayEvent, RequestKind};
pub use peripheral::{LinkHandle, PeripheralAddress};
pub use platform::BtleplugGateway;
pub use queue::{GattQueue, GattRequest};
pub use scanner::{AdvertisementStream, ScanHandle, ScanState, Scanner};
pub use uuids::*;
