//! Outbound command frames.

use std::fmt;

use byteorder::{LittleEndian, WriteBytesExt};

use super::constants::*;

/// Kind of object held by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Init packet (firmware.dat).
    Command,
    /// Firmware image (firmware.bin).
    Data,
}

impl ObjectKind {
    /// Object type byte carried by Create and Select.
    pub const fn type_byte(self) -> u8 {
        match self {
            ObjectKind::Command => OBJECT_COMMAND,
            ObjectKind::Data => OBJECT_DATA,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Command => write!(f, "init packet"),
            ObjectKind::Data => write!(f, "firmware image"),
        }
    }
}

/// A control-point command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Reboot into the bootloader (buttonless characteristic).
    ButtonCommand,
    /// Create a new object of `size` bytes.
    Create { kind: ObjectKind, size: u32 },
    /// Packet receipt notifications.
    ReceiptNotifications,
    /// Ask for offset and CRC of everything received so far.
    CalculateChecksum,
    /// Execute (validate and store) the current object.
    Execute,
    /// Select an object kind and read `maxSize, offset, crc`.
    Select(ObjectKind),
}

impl Operation {
    /// First byte of the frame; responses echo it.
    pub const fn opcode(&self) -> u8 {
        match self {
            Operation::ButtonCommand => OP_BUTTON,
            Operation::Create { .. } => OP_CREATE,
            Operation::ReceiptNotifications => OP_RECEIPT_NOTIFICATIONS,
            Operation::CalculateChecksum => OP_CALCULATE_CHECKSUM,
            Operation::Execute => OP_EXECUTE,
            Operation::Select(_) => OP_SELECT,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Operation::ButtonCommand => "Button command",
            Operation::Create {
                kind: ObjectKind::Command,
                ..
            } => "Create command object",
            Operation::Create {
                kind: ObjectKind::Data,
                ..
            } => "Create data object",
            Operation::ReceiptNotifications => "Receipt notifications",
            Operation::CalculateChecksum => "Calculate checksum",
            Operation::Execute => "Execute",
            Operation::Select(ObjectKind::Command) => "Select command",
            Operation::Select(ObjectKind::Data) => "Select data",
        }
    }

    /// Build the wire frame: opcode bytes followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6);
        buf.push(self.opcode());
        match *self {
            Operation::Create { kind, size } => {
                buf.push(kind.type_byte());
                // Writing into a Vec cannot fail.
                let _ = buf.write_u32::<LittleEndian>(size);
            }
            Operation::Select(kind) => buf.push(kind.type_byte()),
            Operation::ButtonCommand
            | Operation::ReceiptNotifications
            | Operation::CalculateChecksum
            | Operation::Execute => {}
        }
        buf
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-readable name for an echoed opcode byte.
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        OP_CREATE => "Create",
        OP_RECEIPT_NOTIFICATIONS => "Receipt notifications",
        OP_CALCULATE_CHECKSUM => "Calculate checksum",
        OP_EXECUTE => "Execute",
        OP_SELECT => "Select",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_frames() {
        assert_eq!(Operation::ButtonCommand.encode(), vec![0x01]);
        assert_eq!(Operation::ReceiptNotifications.encode(), vec![0x02]);
        assert_eq!(Operation::CalculateChecksum.encode(), vec![0x03]);
        assert_eq!(Operation::Execute.encode(), vec![0x04]);
    }

    #[test]
    fn test_select_frames() {
        assert_eq!(
            Operation::Select(ObjectKind::Command).encode(),
            vec![0x06, 0x01]
        );
        assert_eq!(Operation::Select(ObjectKind::Data).encode(), vec![0x06, 0x02]);
    }

    #[test]
    fn test_create_carries_le_size() {
        let op = Operation::Create {
            kind: ObjectKind::Data,
            size: 0x0000_1000,
        };
        assert_eq!(op.encode(), vec![0x01, 0x02, 0x00, 0x10, 0x00, 0x00]);

        let op = Operation::Create {
            kind: ObjectKind::Command,
            size: 141,
        };
        assert_eq!(op.encode(), vec![0x01, 0x01, 141, 0, 0, 0]);
    }

    #[test]
    fn test_button_and_create_share_opcode() {
        let create = Operation::Create {
            kind: ObjectKind::Command,
            size: 1,
        };
        assert_eq!(Operation::ButtonCommand.opcode(), create.opcode());
    }

    #[test]
    fn test_names() {
        assert_eq!(Operation::Select(ObjectKind::Data).name(), "Select data");
        assert_eq!(opcode_name(0x03), "Calculate checksum");
        assert_eq!(opcode_name(0x7F), "Unknown");
    }
}
