//! Error types for a DFU session.

use thiserror::Error;

use crate::protocol::{FrameError, ObjectKind, Rejection, opcode_name};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum DfuError {
    #[error("Unable to find DFU service")]
    ServiceNotFound,

    #[error("Unable to find {0} characteristic")]
    CharacteristicNotFound(&'static str),

    #[error("{0} characteristic does not support notifications")]
    NotificationsUnsupported(&'static str),

    #[error("Unsupported device: no DFU or buttonless characteristics")]
    UnsupportedDevice,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("Device reported a max size of 0 for the {object}")]
    InvalidMaxSize { object: ObjectKind },

    #[error("Device reported offset {offset} beyond the page end {end}")]
    OffsetOutOfRange { offset: u32, end: u32 },

    #[error("{} failed: {reason}", opcode_name(*.opcode))]
    Rejected { opcode: u8, reason: Rejection },

    #[error("CRC doesn't match for the {object} after {attempts} attempts")]
    ChecksumMismatch { object: ObjectKind, attempts: u32 },

    #[error("Transfer of the {object} stalled at offset {offset}")]
    Stalled { object: ObjectKind, offset: u32 },

    #[error("Disconnected")]
    Disconnected,

    #[error("Aborted")]
    Aborted,

    #[error("Operation 0x{0:02X} is already pending")]
    OperationPending(u8),

    #[error("{0} not specified")]
    MissingPayload(&'static str),

    #[error("Init packet of {size} bytes exceeds the command object max size of {max_size}")]
    InitPacketTooLarge { size: usize, max_size: u32 },
}

impl DfuError {
    /// Failures that already produced an `Error` event where they happened.
    pub(crate) fn is_reported(&self) -> bool {
        matches!(
            self,
            DfuError::Rejected { .. } | DfuError::ChecksumMismatch { .. } | DfuError::Aborted
        )
    }
}

pub type DfuResult<T> = Result<T, DfuError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExtendedError, ResultCode};

    #[test]
    fn test_rejection_message_names_operation() {
        let err = DfuError::Rejected {
            opcode: 0x04,
            reason: Rejection::Extended(ExtendedError::SignatureMissing),
        };
        assert_eq!(err.to_string(), "Execute failed: Signature missing");

        let err = DfuError::Rejected {
            opcode: 0x01,
            reason: Rejection::Result(ResultCode::InsufficientResources),
        };
        assert_eq!(err.to_string(), "Create failed: Insufficient resources");
    }

    #[test]
    fn test_missing_payload_message() {
        assert_eq!(
            DfuError::MissingPayload("Init").to_string(),
            "Init not specified"
        );
    }

    #[test]
    fn test_transport_disconnect_is_not_reported() {
        assert!(!DfuError::Disconnected.is_reported());
        assert!(DfuError::Aborted.is_reported());
    }
}
