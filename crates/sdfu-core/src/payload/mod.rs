//! Payload handling module.
//!
//! Provides page math, packet chunking and resume reconciliation for
//! the init packet and firmware image.

pub mod object;

pub use object::{PageBounds, Resumption, TransferObject, packets, page_bounds};
