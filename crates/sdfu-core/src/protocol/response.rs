//! Response frame decoding.
//!
//! Every notification on the control point has the shape
//! `[tag, echoed opcode, result, payload...]`. Successful Select and
//! Calculate Checksum replies carry little-endian fields after the result.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unrecognised control characteristic response notification (tag 0x{tag:02X})")]
    Unrecognised { tag: u8 },
    #[error("Response too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Result codes other than Success and Extended error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    InvalidCode,
    OpcodeNotSupported,
    InvalidParameter,
    InsufficientResources,
    InvalidObject,
    UnsupportedType,
    OperationNotPermitted,
    OperationFailed,
    Unknown(u8),
}

impl ResultCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            RESULT_INVALID_CODE => ResultCode::InvalidCode,
            RESULT_OPCODE_NOT_SUPPORTED => ResultCode::OpcodeNotSupported,
            RESULT_INVALID_PARAMETER => ResultCode::InvalidParameter,
            RESULT_INSUFFICIENT_RESOURCES => ResultCode::InsufficientResources,
            RESULT_INVALID_OBJECT => ResultCode::InvalidObject,
            RESULT_UNSUPPORTED_TYPE => ResultCode::UnsupportedType,
            RESULT_OPERATION_NOT_PERMITTED => ResultCode::OperationNotPermitted,
            RESULT_OPERATION_FAILED => ResultCode::OperationFailed,
            other => ResultCode::Unknown(other),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::InvalidCode => write!(f, "Invalid code"),
            ResultCode::OpcodeNotSupported => write!(f, "Opcode not supported"),
            ResultCode::InvalidParameter => write!(f, "Invalid parameter"),
            ResultCode::InsufficientResources => write!(f, "Insufficient resources"),
            ResultCode::InvalidObject => write!(f, "Invalid object"),
            ResultCode::UnsupportedType => write!(f, "Unsupported type"),
            ResultCode::OperationNotPermitted => write!(f, "Operation not permitted"),
            ResultCode::OperationFailed => write!(f, "Operation failed"),
            ResultCode::Unknown(code) => write!(f, "Unknown result code 0x{:02X}", code),
        }
    }
}

/// Sub-codes carried by an Extended error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedError {
    NoError,
    InvalidErrorCode,
    WrongCommandFormat,
    UnknownCommand,
    InitCommandInvalid,
    FirmwareVersionFailure,
    HardwareVersionFailure,
    SoftdeviceVersionFailure,
    SignatureMissing,
    WrongHashType,
    HashFailed,
    WrongSignatureType,
    VerificationFailed,
    InsufficientSpace,
    Unknown(u8),
}

impl ExtendedError {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x00 => ExtendedError::NoError,
            0x01 => ExtendedError::InvalidErrorCode,
            0x02 => ExtendedError::WrongCommandFormat,
            0x03 => ExtendedError::UnknownCommand,
            0x04 => ExtendedError::InitCommandInvalid,
            0x05 => ExtendedError::FirmwareVersionFailure,
            0x06 => ExtendedError::HardwareVersionFailure,
            0x07 => ExtendedError::SoftdeviceVersionFailure,
            0x08 => ExtendedError::SignatureMissing,
            0x09 => ExtendedError::WrongHashType,
            0x0A => ExtendedError::HashFailed,
            0x0B => ExtendedError::WrongSignatureType,
            0x0C => ExtendedError::VerificationFailed,
            0x0D => ExtendedError::InsufficientSpace,
            other => ExtendedError::Unknown(other),
        }
    }
}

impl fmt::Display for ExtendedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExtendedError::NoError => "No error",
            ExtendedError::InvalidErrorCode => "Invalid error code",
            ExtendedError::WrongCommandFormat => "Wrong command format",
            ExtendedError::UnknownCommand => "Unknown command",
            ExtendedError::InitCommandInvalid => "Init command invalid",
            ExtendedError::FirmwareVersionFailure => "Firmware version failure",
            ExtendedError::HardwareVersionFailure => "Hardware version failure",
            ExtendedError::SoftdeviceVersionFailure => "Softdevice version failure",
            ExtendedError::SignatureMissing => "Signature missing",
            ExtendedError::WrongHashType => "Wrong hash type",
            ExtendedError::HashFailed => "Hash failed",
            ExtendedError::WrongSignatureType => "Wrong signature type",
            ExtendedError::VerificationFailed => "Verification failed",
            ExtendedError::InsufficientSpace => "Insufficient space",
            ExtendedError::Unknown(code) => {
                return write!(f, "Unknown extended error 0x{:02X}", code);
            }
        };
        f.write_str(text)
    }
}

/// Why the bootloader refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Result(ResultCode),
    Extended(ExtendedError),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Result(code) => write!(f, "{}", code),
            Rejection::Extended(code) => write!(f, "{}", code),
        }
    }
}

/// A decoded control-point notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Opcode echoed by the device.
    pub opcode: u8,
    /// Payload following the result byte, or the rejection reason.
    pub outcome: Result<Vec<u8>, Rejection>,
}

impl ResponseFrame {
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let tag = *data.first().ok_or(FrameError::TooShort {
            expected: RESPONSE_HEADER_SIZE,
            actual: 0,
        })?;
        if !RESPONSE_TAGS.contains(&tag) {
            return Err(FrameError::Unrecognised { tag });
        }
        if data.len() < RESPONSE_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: RESPONSE_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let opcode = data[1];
        let outcome = match data[2] {
            RESULT_SUCCESS => Ok(data[RESPONSE_HEADER_SIZE..].to_vec()),
            RESULT_EXTENDED_ERROR => {
                let sub_code = *data.get(RESPONSE_HEADER_SIZE).ok_or(FrameError::TooShort {
                    expected: RESPONSE_HEADER_SIZE + 1,
                    actual: data.len(),
                })?;
                Err(Rejection::Extended(ExtendedError::from_byte(sub_code)))
            }
            code => Err(Rejection::Result(ResultCode::from_byte(code))),
        };

        Ok(Self { opcode, outcome })
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Payload of a successful Select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectResponse {
    pub max_size: u32,
    pub offset: u32,
    pub crc: i32,
}

impl SelectResponse {
    pub const SIZE: usize = 12;

    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < Self::SIZE {
            return Err(FrameError::TooShort {
                expected: Self::SIZE,
                actual: payload.len(),
            });
        }
        let mut cursor = Cursor::new(payload);
        let short = |_| FrameError::TooShort {
            expected: Self::SIZE,
            actual: payload.len(),
        };
        Ok(Self {
            max_size: cursor.read_u32::<LittleEndian>().map_err(short)?,
            offset: cursor.read_u32::<LittleEndian>().map_err(short)?,
            crc: cursor.read_i32::<LittleEndian>().map_err(short)?,
        })
    }
}

/// Payload of a successful Calculate Checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumResponse {
    pub offset: u32,
    pub crc: i32,
}

impl ChecksumResponse {
    pub const SIZE: usize = 8;

    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < Self::SIZE {
            return Err(FrameError::TooShort {
                expected: Self::SIZE,
                actual: payload.len(),
            });
        }
        let mut cursor = Cursor::new(payload);
        let short = |_| FrameError::TooShort {
            expected: Self::SIZE,
            actual: payload.len(),
        };
        Ok(Self {
            offset: cursor.read_u32::<LittleEndian>().map_err(short)?,
            crc: cursor.read_i32::<LittleEndian>().map_err(short)?,
        })
    }
}
