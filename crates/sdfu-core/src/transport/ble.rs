//! btleplug-based BLE transport implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::{
    DfuTransport, GattCharacteristic, GattService, NotificationHandler, TransportError,
};
use crate::protocol::SERVICE_UUID;

/// How often `open` re-checks the adapter's peripheral list while scanning.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How to pick the target device during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Match the Bluetooth address (case-insensitive).
    Address(String),
    /// Match the advertised local name.
    Name(String),
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::Address(address) => write!(f, "address {}", address),
            DeviceSelector::Name(name) => write!(f, "name {}", name),
        }
    }
}

/// A device seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the Secure DFU service.
    pub dfu_service: bool,
}

/// Notification forwarding tasks, at most one per characteristic.
#[derive(Default)]
struct SubscriptionTasks(Mutex<HashMap<Uuid, JoinHandle<()>>>);

impl SubscriptionTasks {
    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, JoinHandle<()>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `task` for `characteristic`, stopping the one it replaces.
    fn replace(&self, characteristic: Uuid, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks().insert(characteristic, task) {
            debug!(%characteristic, "Replacing notification handler");
            previous.abort();
        }
    }
}

impl Drop for SubscriptionTasks {
    fn drop(&mut self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }
}

/// BLE transport backed by the platform Bluetooth stack.
pub struct BtleplugTransport {
    peripheral: Peripheral,
    link: Arc<watch::Sender<bool>>,
    watcher: JoinHandle<()>,
    subscriptions: SubscriptionTasks,
}

impl BtleplugTransport {
    /// First Bluetooth adapter of the system.
    pub async fn first_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        adapters.into_iter().next().ok_or(TransportError::NoAdapter)
    }

    /// Packet acknowledgement default for this platform.
    ///
    /// CoreBluetooth flow-controls unacknowledged writes itself, so macOS
    /// defaults to write-without-response.
    pub fn default_packet_write_with_response() -> bool {
        !cfg!(target_os = "macos")
    }

    /// Scan for `duration` and list the devices seen.
    pub async fn scan(
        adapter: &Adapter,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        adapter.start_scan(ScanFilter::default()).await?;
        time::sleep(duration).await;

        let mut discovered = Vec::new();
        for peripheral in adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                discovered.push(DiscoveredDevice {
                    name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                    address: props.address.to_string(),
                    rssi: props.rssi,
                    dfu_service: props.services.contains(&SERVICE_UUID),
                });
            }
        }

        adapter.stop_scan().await?;
        Ok(discovered)
    }

    /// Scan until a device matching `selector` shows up, for at most `timeout`.
    pub async fn open(
        adapter: Adapter,
        selector: DeviceSelector,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        info!(target = %selector, "Scanning for device");
        adapter.start_scan(ScanFilter::default()).await?;

        let found = time::timeout(timeout, async {
            loop {
                if let Some(peripheral) = Self::find(&adapter, &selector).await? {
                    return Ok::<_, TransportError>(peripheral);
                }
                time::sleep(SCAN_POLL_INTERVAL).await;
            }
        })
        .await;

        adapter.stop_scan().await?;
        let peripheral = match found {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::DeviceNotFound(selector.to_string())),
        };

        let (link, _) = watch::channel(peripheral.is_connected().await?);
        let link = Arc::new(link);

        let mut events = adapter.events().await?;
        let id = peripheral.id();
        let watcher_link = Arc::clone(&link);
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDisconnected(peer) if peer == id => {
                        debug!("Link dropped");
                        watcher_link.send_replace(false);
                    }
                    CentralEvent::DeviceConnected(peer) if peer == id => {
                        watcher_link.send_replace(true);
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            peripheral,
            link,
            watcher,
            subscriptions: SubscriptionTasks::default(),
        })
    }

    async fn find(
        adapter: &Adapter,
        selector: &DeviceSelector,
    ) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let matched = match selector {
                DeviceSelector::Address(address) => {
                    props.address.to_string().eq_ignore_ascii_case(address)
                }
                DeviceSelector::Name(name) => props.local_name.as_deref() == Some(name.as_str()),
            };
            if matched {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl DfuTransport for BtleplugTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await? {
            self.peripheral
                .connect()
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        }
        self.link.send_replace(true);
        Ok(())
    }

    async fn discover_service(&self, uuid: Uuid) -> Result<GattService, TransportError> {
        self.peripheral.discover_services().await?;
        self.peripheral
            .services()
            .iter()
            .find(|s| s.uuid == uuid)
            .map(|s| GattService { uuid: s.uuid })
            .ok_or(TransportError::ServiceNotFound(uuid))
    }

    async fn discover_characteristics(
        &self,
        service: &GattService,
    ) -> Result<Vec<GattCharacteristic>, TransportError> {
        let found = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service.uuid)
            .ok_or(TransportError::ServiceNotFound(service.uuid))?;
        Ok(found
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                can_notify: c.properties.contains(CharPropFlags::NOTIFY),
                can_indicate: c.properties.contains(CharPropFlags::INDICATE),
            })
            .collect())
    }

    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        let mut notifications = self.peripheral.notifications().await?;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic {
                    handler(&notification.value);
                }
            }
        });
        self.subscriptions.replace(characteristic, task);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!(error = %e, "Disconnect failed");
            return Err(e.into());
        }
        self.link.send_replace(false);
        Ok(())
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    /// A task that runs until aborted; `rx` resolves with an error once it is gone.
    fn parked() -> (JoinHandle<()>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        (task, rx)
    }

    #[tokio::test]
    async fn test_resubscribe_stops_previous_task() {
        let tasks = SubscriptionTasks::default();
        let control = Uuid::from_u128(1);
        let (first, first_gone) = parked();
        let (second, mut second_gone) = parked();

        tasks.replace(control, first);
        tasks.replace(control, second);

        assert!(first_gone.await.is_err());
        assert!(matches!(
            second_gone.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(tasks.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_other_characteristics_are_kept() {
        let tasks = SubscriptionTasks::default();
        let (control, control_gone) = parked();
        let (button, mut button_gone) = parked();

        tasks.replace(Uuid::from_u128(1), control);
        tasks.replace(Uuid::from_u128(3), button);
        assert_eq!(tasks.tasks().len(), 2);
        assert!(matches!(
            button_gone.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        drop(tasks);
        assert!(control_gone.await.is_err());
        assert!(button_gone.await.is_err());
    }
}
