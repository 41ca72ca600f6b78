//! Service and characteristic UUIDs used by the hand firmware.

use uuid::Uuid;

// Hand GATT service (ESP32 firmware)
/// Hand data service UUID.
pub const HAND_SERVICE_UUID: Uuid = Uuid::from_u128(0x4faf_c201_1fb5_459e_8fcc_c5c9c331914b);
/// Hand data characteristic UUID (Write, Notify).
///
/// Commands are written to and telemetry is notified from the same
/// characteristic.
pub const HAND_DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xbeb5_483e_36e1_4688_b7f5_ea07361b26a8);

// Classic Bluetooth
/// Serial Port Profile service UUID used by the RFCOMM firmware build.
pub const SERIAL_PORT_PROFILE_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_00805f9b34fb);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            HAND_SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            HAND_DATA_CHARACTERISTIC_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(
            SERIAL_PORT_PROFILE_UUID.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }
}
