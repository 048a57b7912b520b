//! SDFU-Core: Nordic Secure DFU over Bluetooth Low Energy in Rust.
//!
//! This crate drives a Secure DFU bootloader through the object transfer
//! protocol: the init packet (command object) and the firmware image
//! (data object) are each selected, created page by page, streamed in
//! 20-byte packets, verified by CRC-32 and executed. Interrupted transfers
//! are resumed from what the device already holds.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, command encoding, response decoding
//! - **Transport**: BLE GATT abstraction (btleplug, mock bootloader)
//! - **Correlator / Control**: Request/response pairing on the control point
//! - **Engine**: Per-object transfer with resume and retry
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use sdfu_core::session::{SecureDfu, SessionConfig};
//! use sdfu_core::transport::{BtleplugTransport, DeviceSelector};
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let adapter = BtleplugTransport::first_adapter().await?;
//! let transport = BtleplugTransport::open(
//!     adapter,
//!     DeviceSelector::Name("DfuTarg".to_string()),
//!     Duration::from_secs(10),
//! )
//! .await?;
//!
//! let init = std::fs::read("app.dat")?;
//! let firmware = std::fs::read("app.bin")?;
//!
//! let dfu = SecureDfu::new(SessionConfig::default());
//! dfu.update(&transport, &init, &firmware).await?;
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod config;
pub mod control;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use checksum::{Checksum, Crc32Fn, crc32_ieee};
pub use config::SessionConfig;
pub use engine::AbortHandle;
pub use error::{DfuError, DfuResult};
pub use events::{
    ChannelObserver, DfuEvent, DfuObserver, DfuState, LogLevel, NullObserver, ProgressObject,
    TracingObserver,
};
pub use protocol::{FrameError, ObjectKind, Operation, Rejection, ResponseFrame};
pub use session::{DfuChannels, SecureDfu};
pub use transport::{
    BtleplugTransport, DeviceSelector, DfuTransport, MockTransport, TransportError,
};
