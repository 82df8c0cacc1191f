//! Advertisement records and scan filters.
//!
//! An [`AdvertisementRecord`] is produced per scan callback and lives only as
//! long as the scan session that observed it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::ble::peripheral::PeripheralAddress;
use crate::error::{Error, Result};

/// AD type: Complete List of 16-bit Service UUIDs.
pub const AD_TYPE_COMPLETE_16BIT_UUIDS: u8 = 0x03;
/// AD type: Complete List of 128-bit Service UUIDs.
pub const AD_TYPE_COMPLETE_128BIT_UUIDS: u8 = 0x07;
/// AD type: Shortened Local Name.
pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
/// AD type: Complete Local Name.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// AD type: Manufacturer Specific Data.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xff;

/// One observed advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementRecord {
    /// The advertising peripheral.
    pub address: PeripheralAddress,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Advertised service UUIDs.
    pub service_uuids: BTreeSet<Uuid>,
    /// Raw advertising payload as a sequence of AD structures.
    pub raw_payload: Bytes,
    /// When the advertisement was observed.
    pub timestamp: DateTime<Utc>,
}

impl AdvertisementRecord {
    /// Create a record observed now.
    pub fn new(address: PeripheralAddress, rssi: i16) -> Self {
        Self {
            address,
            name: None,
            rssi,
            service_uuids: BTreeSet::new(),
            raw_payload: Bytes::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the local name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an advertised service UUID.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.insert(uuid);
        self
    }

    /// Set the raw payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.raw_payload = payload.into();
        self
    }

    /// Iterate over the AD structures of the raw payload.
    pub fn ad_structures(&self) -> AdStructures<'_> {
        AdStructures {
            data: &self.raw_payload,
        }
    }

    /// Manufacturer-specific data keyed by company identifier.
    pub fn manufacturer_data(&self) -> HashMap<u16, Vec<u8>> {
        self.ad_structures()
            .filter_map(|ad| ad.ok())
            .filter(|ad| ad.ad_type == AD_TYPE_MANUFACTURER_DATA && ad.data.len() >= 2)
            .map(|ad| {
                let company = u16::from_le_bytes([ad.data[0], ad.data[1]]);
                (company, ad.data[2..].to_vec())
            })
            .collect()
    }

    /// The local name carried in the payload, preferring the complete form.
    pub fn payload_local_name(&self) -> Option<String> {
        let mut short = None;
        for ad in self.ad_structures().filter_map(|ad| ad.ok()) {
            match ad.ad_type {
                AD_TYPE_COMPLETE_LOCAL_NAME => {
                    return Some(String::from_utf8_lossy(ad.data).into_owned());
                }
                AD_TYPE_SHORT_LOCAL_NAME => {
                    short = Some(String::from_utf8_lossy(ad.data).into_owned());
                }
                _ => {}
            }
        }
        short
    }
}

/// One AD structure (length, type, data) inside an advertising payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    /// The AD type byte.
    pub ad_type: u8,
    /// The AD data (without length and type).
    pub data: &'a [u8],
}

/// Iterator over the AD structures of a payload.
///
/// Stops at the first zero-length structure (padding); yields an error once
/// if a structure overruns the payload.
#[derive(Debug, Clone)]
pub struct AdStructures<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = Result<AdStructure<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.data.split_first()?;
        if len == 0 {
            self.data = &[];
            return None;
        }

        let len = len as usize;
        if rest.len() < len {
            self.data = &[];
            return Some(Err(Error::InvalidParameter {
                name: "ad_structure_length".to_string(),
                value: len.to_string(),
            }));
        }

        let (structure, remaining) = rest.split_at(len);
        self.data = remaining;
        Some(Ok(AdStructure {
            ad_type: structure[0],
            data: &structure[1..],
        }))
    }
}

/// Append one AD structure to a payload buffer.
///
/// Data longer than 254 bytes is truncated to fit the length byte.
pub fn push_ad_structure(buf: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    let data = &data[..data.len().min(254)];
    buf.push(data.len() as u8 + 1);
    buf.push(ad_type);
    buf.extend_from_slice(data);
}

/// How repeated advertisements from one peripheral are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DuplicatePolicy {
    /// Report each address once per scan session.
    #[default]
    FirstSeen,
    /// Report every advertisement (raw mode).
    Every,
}

/// Which advertisements a scan session reports.
///
/// Empty criteria match everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilter {
    /// Require at least one of these service UUIDs.
    pub services: BTreeSet<Uuid>,
    /// Require the local name to start with this prefix.
    pub name_prefix: Option<String>,
    /// Require at least this RSSI.
    pub min_rssi: Option<i16>,
    /// Only report these peripherals.
    pub addresses: BTreeSet<PeripheralAddress>,
    /// Duplicate reporting policy.
    pub duplicates: DuplicatePolicy,
}

impl ScanFilter {
    /// Filter on a service UUID.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.insert(uuid);
        self
    }

    /// Filter on a local name prefix.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Filter on a minimum RSSI.
    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = Some(rssi);
        self
    }

    /// Only report the given peripheral.
    pub fn with_address(mut self, address: impl Into<PeripheralAddress>) -> Self {
        self.addresses.insert(address.into());
        self
    }

    /// Set the duplicate policy.
    pub fn with_duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    /// Whether a record passes this filter.
    pub fn matches(&self, record: &AdvertisementRecord) -> bool {
        if !self.services.is_empty() && self.services.is_disjoint(&record.service_uuids) {
            return false;
        }

        if let Some(prefix) = &self.name_prefix {
            let name_matches = record
                .name
                .as_deref()
                .map(|n| n.starts_with(prefix.as_str()))
                .unwrap_or(false);
            if !name_matches {
                return false;
            }
        }

        if let Some(min) = self.min_rssi {
            if record.rssi < min {
                return false;
            }
        }

        self.addresses.is_empty() || self.addresses.contains(&record.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID};

    fn record(name: Option<&str>, rssi: i16) -> AdvertisementRecord {
        let mut record = AdvertisementRecord::new("AA:BB:CC:DD:EE:FF".into(), rssi)
            .with_service(HEART_RATE_SERVICE_UUID);
        record.name = name.map(str::to_string);
        record
    }

    #[test]
    fn test_default_filter_matches_everything() {
        assert!(ScanFilter::default().matches(&record(None, -100)));
    }

    #[test]
    fn test_service_filter() {
        let hr = ScanFilter::default().with_service(HEART_RATE_SERVICE_UUID);
        let battery = ScanFilter::default().with_service(BATTERY_SERVICE_UUID);
        assert!(hr.matches(&record(None, -60)));
        assert!(!battery.matches(&record(None, -60)));
    }

    #[test]
    fn test_name_and_rssi_filter() {
        let filter = ScanFilter::default()
            .with_name_prefix("Polar")
            .with_min_rssi(-70);
        assert!(filter.matches(&record(Some("Polar H10"), -65)));
        assert!(!filter.matches(&record(Some("Polar H10"), -80)));
        assert!(!filter.matches(&record(Some("Garmin"), -50)));
        assert!(!filter.matches(&record(None, -50)));
    }

    #[test]
    fn test_address_filter() {
        let filter = ScanFilter::default().with_address("aa:bb:cc:dd:ee:ff");
        assert!(filter.matches(&record(None, -60)));

        let other = ScanFilter::default().with_address("11:22:33:44:55:66");
        assert!(!other.matches(&record(None, -60)));
    }

    #[test]
    fn test_ad_structures() {
        let mut payload = Vec::new();
        push_ad_structure(&mut payload, 0x01, &[0x06]);
        push_ad_structure(&mut payload, AD_TYPE_COMPLETE_LOCAL_NAME, b"HRM");
        push_ad_structure(&mut payload, AD_TYPE_MANUFACTURER_DATA, &[0x59, 0x00, 0xaa]);

        let record = record(None, -60).with_payload(payload);
        let types: Vec<u8> = record
            .ad_structures()
            .map(|ad| ad.map(|ad| ad.ad_type))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(types, vec![0x01, AD_TYPE_COMPLETE_LOCAL_NAME, AD_TYPE_MANUFACTURER_DATA]);
        assert_eq!(record.payload_local_name().as_deref(), Some("HRM"));
        assert_eq!(record.manufacturer_data().get(&0x0059), Some(&vec![0xaa]));
    }

    #[test]
    fn test_truncated_ad_structure() {
        let record = record(None, -60).with_payload(vec![0x05, 0x09, b'a']);
        let mut iter = record.ad_structures();
        assert!(matches!(iter.next(), Some(Err(Error::InvalidParameter { .. }))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_zero_length_padding_stops() {
        let record = record(None, -60).with_payload(vec![0x02, 0x01, 0x06, 0x00, 0x00]);
        assert_eq!(record.ad_structures().count(), 1);
    }
}
