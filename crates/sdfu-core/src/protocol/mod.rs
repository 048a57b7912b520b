//! Protocol module - Secure DFU wire format.

pub mod constants;
pub mod operation;
pub mod response;

pub use constants::*;
pub use operation::{ObjectKind, Operation, opcode_name};
pub use response::{
    ChecksumResponse, ExtendedError, FrameError, Rejection, ResponseFrame, ResultCode,
    SelectResponse,
};
