//! Peripheral identity types.

use std::fmt;

use crate::utils::normalize_address;

/// Opaque, immutable identifier of a remote peripheral.
///
/// MAC-style addresses are normalized to upper-case colon form so that
/// `"aa:bb:cc:dd:ee:ff"` and `"AA:BB:CC:DD:EE:FF"` name the same device.
/// Platform identifiers that are not MAC addresses (CoreBluetooth UUIDs,
/// BlueZ object paths) are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    /// Create an address from its textual form.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(normalize_address(raw.as_ref()))
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralAddress {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for PeripheralAddress {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&PeripheralAddress> for PeripheralAddress {
    fn from(address: &PeripheralAddress) -> Self {
        address.clone()
    }
}

/// Gateway-issued handle for one physical GATT link.
///
/// A new link id is issued on every `gatt_open`, so events belonging to a
/// previous link of the same peripheral can be told apart and dropped.
/// Never exposed through the public façade.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    /// Gateway-unique link id.
    pub id: u64,
    /// The peripheral this link belongs to.
    pub address: PeripheralAddress,
}

impl LinkHandle {
    /// Create a new link handle.
    pub fn new(id: u64, address: PeripheralAddress) -> Self {
        Self { id, address }
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.id)
    }
}
