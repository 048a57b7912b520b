//! Protocol constants for Nordic Secure DFU over BLE.
//!
//! Derived from the nRF5 SDK bootloader documentation (`nrf_dfu_req_handler.h`).

use uuid::Uuid;

// ============================================================================
// GATT Identifiers
// ============================================================================

/// Secure DFU service (16-bit `0xFE59` in the Bluetooth base UUID).
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fe59_0000_1000_8000_00805f9b34fb);

/// Control point: commands out, status notifications in.
pub const CONTROL_UUID: Uuid = Uuid::from_u128(0x8ec90001_f315_4f60_9fb8_838830daea50);

/// Packet characteristic: raw object bytes.
pub const PACKET_UUID: Uuid = Uuid::from_u128(0x8ec90002_f315_4f60_9fb8_838830daea50);

/// Buttonless DFU characteristic (application mode only).
pub const BUTTON_UUID: Uuid = Uuid::from_u128(0x8ec90003_f315_4f60_9fb8_838830daea50);

/// Expand a 16-bit SIG UUID into the full 128-bit form.
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

// ============================================================================
// Opcodes (Host -> Device)
// ============================================================================

/// Create object (also Button command on the buttonless characteristic).
pub const OP_CREATE: u8 = 0x01;
/// Enter bootloader; shares its value with Create.
pub const OP_BUTTON: u8 = 0x01;
/// Set packet receipt notification.
pub const OP_RECEIPT_NOTIFICATIONS: u8 = 0x02;
/// Calculate checksum of the current object.
pub const OP_CALCULATE_CHECKSUM: u8 = 0x03;
/// Execute the current object.
pub const OP_EXECUTE: u8 = 0x04;
/// Select object type and read its state.
pub const OP_SELECT: u8 = 0x06;

/// Object type byte for the init packet.
pub const OBJECT_COMMAND: u8 = 0x01;
/// Object type byte for the firmware image.
pub const OBJECT_DATA: u8 = 0x02;

// ============================================================================
// Responses (Device -> Host)
// ============================================================================

/// Response tag sent on the control point.
pub const RESPONSE_TAG: u8 = 0x60;
/// Response tag sent on the buttonless characteristic.
pub const BUTTONLESS_RESPONSE_TAG: u8 = 0x20;
/// Tags accepted as the first byte of a response frame.
pub const RESPONSE_TAGS: [u8; 2] = [RESPONSE_TAG, BUTTONLESS_RESPONSE_TAG];

pub const RESULT_INVALID_CODE: u8 = 0x00;
pub const RESULT_SUCCESS: u8 = 0x01;
pub const RESULT_OPCODE_NOT_SUPPORTED: u8 = 0x02;
pub const RESULT_INVALID_PARAMETER: u8 = 0x03;
pub const RESULT_INSUFFICIENT_RESOURCES: u8 = 0x04;
pub const RESULT_INVALID_OBJECT: u8 = 0x05;
pub const RESULT_UNSUPPORTED_TYPE: u8 = 0x07;
pub const RESULT_OPERATION_NOT_PERMITTED: u8 = 0x08;
pub const RESULT_OPERATION_FAILED: u8 = 0x0A;
pub const RESULT_EXTENDED_ERROR: u8 = 0x0B;

/// Size of the `tag, opcode, result` prefix of every response.
pub const RESPONSE_HEADER_SIZE: usize = 3;

// ============================================================================
// Transfer Parameters
// ============================================================================

/// Bytes per packet-characteristic write (default ATT MTU minus header).
pub const PACKET_SIZE: usize = 20;

/// Bound on one control operation (write + correlated notification).
pub const OPERATION_TIMEOUT_MS: u64 = 5000;

/// Attempts per init packet before giving up on checksum mismatches.
pub const INIT_ATTEMPTS: u32 = 3;

/// Default attempts per firmware page.
pub const FIRMWARE_ATTEMPTS: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(short_uuid(0xFE59), SERVICE_UUID);
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000fe59-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            CONTROL_UUID.to_string(),
            "8ec90001-f315-4f60-9fb8-838830daea50"
        );
        assert_eq!(
            PACKET_UUID.to_string(),
            "8ec90002-f315-4f60-9fb8-838830daea50"
        );
        assert_eq!(
            BUTTON_UUID.to_string(),
            "8ec90003-f315-4f60-9fb8-838830daea50"
        );
    }
}
