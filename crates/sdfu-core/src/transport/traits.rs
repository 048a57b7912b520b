//! BLE transport layer abstraction.
//!
//! Defines the `DfuTransport` trait for GATT communication,
//! allowing different implementations (btleplug, mock, etc.).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// A discovered GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
}

/// A discovered GATT characteristic and the properties the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub can_notify: bool,
    pub can_indicate: bool,
}

impl GattCharacteristic {
    /// A characteristic that delivers values by notification.
    pub fn notifying(uuid: Uuid) -> Self {
        Self {
            uuid,
            can_notify: true,
            can_indicate: false,
        }
    }

    /// A characteristic without notify or indicate.
    pub fn plain(uuid: Uuid) -> Self {
        Self {
            uuid,
            can_notify: false,
            can_indicate: false,
        }
    }

    pub fn supports_notifications(&self) -> bool {
        self.can_notify || self.can_indicate
    }
}

/// Callback receiving every value notified on a subscribed characteristic.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Abstract BLE transport interface.
///
/// This trait enables:
/// - Production implementation using btleplug
/// - Mock implementation (simulated bootloader) for testing
/// - Future alternative backends
#[async_trait]
pub trait DfuTransport: Send + Sync {
    /// Connect to the device. Connecting an already connected device is a no-op.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Look up a primary service.
    async fn discover_service(&self, uuid: Uuid) -> Result<GattService, TransportError>;

    /// List the characteristics of a discovered service.
    async fn discover_characteristics(
        &self,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>, TransportError>;

    /// Write a value, acknowledged by the peer when `with_response` is set.
    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    /// Enable notifications and deliver each value to `handler`.
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;

    /// Drop the link.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Link state; `false` once the device is disconnected.
    fn link_state(&self) -> watch::Receiver<bool>;
}
