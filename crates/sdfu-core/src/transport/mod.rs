//! Transport layer module.

pub mod ble;
pub mod mock;
pub mod traits;

pub use ble::{BtleplugTransport, DeviceSelector, DiscoveredDevice};
pub use mock::{MockTransport, MockWrite};
pub use traits::{
    DfuTransport, GattCharacteristic, GattService, NotificationHandler, TransportError,
};
