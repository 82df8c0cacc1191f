//! GATT service and characteristic descriptors.
//!
//! A [`ServiceTable`] is populated once service discovery completes and is
//! owned by the connection for that peripheral. Re-discovery replaces the
//! table wholesale; only the cached `last_value` of a characteristic changes
//! in between.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Set of GATT characteristic properties.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Characteristic can be read.
    pub const READ: Self = Self(0x01);
    /// Characteristic can be written with response.
    pub const WRITE: Self = Self(0x02);
    /// Characteristic can be written without response.
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    /// Characteristic supports notifications.
    pub const NOTIFY: Self = Self(0x08);
    /// Characteristic supports indications.
    pub const INDICATE: Self = Self(0x10);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::READ, "READ"),
        (Self::WRITE, "WRITE"),
        (Self::WRITE_NO_RESPONSE, "WRITE_NO_RESPONSE"),
        (Self::NOTIFY, "NOTIFY"),
        (Self::INDICATE, "INDICATE"),
    ];

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every property in `other` is present.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any property in `other` is present.
    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the characteristic can be read.
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Whether the characteristic can be written in either mode.
    pub fn can_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_NO_RESPONSE)
    }

    /// Whether the characteristic can push values (notify or indicate).
    pub fn can_subscribe(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// How a write is delivered to the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteType {
    /// Acknowledged write.
    WithResponse,
    /// Unacknowledged write command.
    WithoutResponse,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
    /// Last value read or notified.
    pub last_value: Option<Vec<u8>>,
}

impl CharacteristicDescriptor {
    /// Create a descriptor with no cached value.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            last_value: None,
        }
    }

    /// The preferred write type for this characteristic.
    ///
    /// Acknowledged writes are used whenever the characteristic supports them.
    pub fn preferred_write_type(&self) -> Option<WriteType> {
        if self.properties.contains(CharacteristicProperties::WRITE) {
            Some(WriteType::WithResponse)
        } else if self
            .properties
            .contains(CharacteristicProperties::WRITE_NO_RESPONSE)
        {
            Some(WriteType::WithoutResponse)
        } else {
            None
        }
    }
}

/// A discovered primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics by UUID.
    pub characteristics: HashMap<Uuid, CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// Create an empty service.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: HashMap::new(),
        }
    }

    /// Add a characteristic.
    pub fn with_characteristic(
        mut self,
        uuid: Uuid,
        properties: CharacteristicProperties,
    ) -> Self {
        self.characteristics
            .insert(uuid, CharacteristicDescriptor::new(uuid, properties));
        self
    }
}

/// Service table of one connection, keyed by service UUID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceTable {
    services: HashMap<Uuid, ServiceDescriptor>,
}

impl ServiceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service, replacing any previous one with the same UUID.
    pub fn insert(&mut self, service: ServiceDescriptor) {
        self.services.insert(service.uuid, service);
    }

    /// Add a service (builder form).
    pub fn with_service(mut self, service: ServiceDescriptor) -> Self {
        self.insert(service);
        self
    }

    /// Look up a service.
    pub fn service(&self, uuid: &Uuid) -> Result<&ServiceDescriptor> {
        self.services
            .get(uuid)
            .ok_or_else(|| Error::unknown_service(uuid))
    }

    /// Look up a characteristic in any service.
    pub fn characteristic(&self, uuid: &Uuid) -> Result<&CharacteristicDescriptor> {
        self.services
            .values()
            .find_map(|s| s.characteristics.get(uuid))
            .ok_or_else(|| Error::unknown_characteristic(uuid))
    }

    /// Look up a characteristic within a specific service.
    pub fn characteristic_in(
        &self,
        service: &Uuid,
        uuid: &Uuid,
    ) -> Result<&CharacteristicDescriptor> {
        self.service(service)?
            .characteristics
            .get(uuid)
            .ok_or_else(|| Error::unknown_characteristic(uuid))
    }

    /// Record the latest value of a characteristic.
    ///
    /// Returns false if the characteristic is not in the table.
    pub fn update_value(&mut self, uuid: &Uuid, value: &[u8]) -> bool {
        let characteristic = self
            .services
            .values_mut()
            .find_map(|s| s.characteristics.get_mut(uuid));

        match characteristic {
            Some(c) => {
                c.last_value = Some(value.to_vec());
                true
            }
            None => false,
        }
    }

    /// Iterate over the services.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Total number of characteristics.
    pub fn characteristic_count(&self) -> usize {
        self.services.values().map(|s| s.characteristics.len()).sum()
    }
}
