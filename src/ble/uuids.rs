//! Bluetooth SIG UUID helpers and well-known constants.

use uuid::Uuid;

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Client Characteristic Configuration Descriptor UUID (0x2902).
pub const CCCD_UUID: Uuid = uuid_from_u16(0x2902);

/// Generic Access Service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = uuid_from_u16(0x1800);
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = uuid_from_u16(0x2a00);

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = uuid_from_u16(0x180a);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = uuid_from_u16(0x2a29);
/// Firmware Revision characteristic UUID.
pub const FIRMWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2a26);

/// Heart Rate Service UUID.
pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180d);
/// Heart Rate Measurement characteristic UUID (Notify).
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2a37);

/// Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180f);
/// Battery Level characteristic UUID (Read, Notify).
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2a19);

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Shorten a UUID to its 16-bit form if it sits on the Bluetooth base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u32;
    if value & !(0xffff_ffffu128 << 96) == BLUETOOTH_BASE_UUID && short <= u16::MAX as u32 {
        Some(short as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(CCCD_UUID.to_string(), "00002902-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_short_uuid() {
        assert_eq!(short_uuid(&HEART_RATE_MEASUREMENT_UUID), Some(0x2a37));
        assert_eq!(short_uuid(&uuid_from_u32(0x0001_0000)), None);

        let vendor = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
        assert_eq!(short_uuid(&vendor), None);
    }
}
