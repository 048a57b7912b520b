//! DFU Session - High-level orchestrator for the update process.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use crate::config::SessionConfig;
pub use crate::engine::AbortHandle;

use crate::checksum::Checksum;
use crate::control::ControlPoint;
use crate::correlator::Correlator;
use crate::engine::ObjectTransfer;
use crate::error::{DfuError, DfuResult};
use crate::events::{DfuEvent, DfuObserver, DfuState, LogLevel, TracingObserver};
use crate::protocol::{BUTTON_UUID, CONTROL_UUID, ObjectKind, Operation, PACKET_UUID, SERVICE_UUID};
use crate::transport::{DfuTransport, GattCharacteristic, NotificationHandler, TransportError};

/// Characteristics used for an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuChannels {
    pub control: Uuid,
    pub packet: Uuid,
}

#[derive(Debug, Default)]
struct SessionState {
    state: Option<DfuState>,
    channels: Option<DfuChannels>,
}

/// Secure DFU session - drives a device through init and firmware transfer.
pub struct SecureDfu<O: DfuObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    checksum: Checksum,
    abort: AbortHandle,
    session: Mutex<SessionState>,
}

impl SecureDfu<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: DfuObserver> SecureDfu<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            checksum: Checksum::default(),
            abort: AbortHandle::new(),
            session: Mutex::new(SessionState::default()),
        }
    }

    /// Replace the CRC function used to verify device state.
    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Last lifecycle state, `None` before the first update.
    pub fn state(&self) -> Option<DfuState> {
        self.session().state
    }

    /// Channels of the update in progress.
    pub fn channels(&self) -> Option<DfuChannels> {
        self.session().channels
    }

    /// Request cancellation; takes effect at the next checkpoint.
    pub fn abort(&self) {
        info!("Abort requested by caller");
        self.abort.abort();
    }

    /// Clonable handle for aborting from another task or a signal handler.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn set_state(&self, state: DfuState) {
        self.session().state = Some(state);
        debug!(state = %state, "Entering state");
        self.emit(DfuEvent::StateChanged { state });
    }

    fn clear_channels(&self) {
        self.session().channels = None;
    }

    fn report(&self, result: &DfuResult<()>) {
        if let Err(err) = result
            && !err.is_reported()
        {
            self.emit(DfuEvent::Error {
                detail: err.to_string(),
            });
        }
    }

    /// Install `init` and `firmware` on the device behind `transport`.
    #[instrument(skip_all, fields(init = init.len(), firmware = firmware.len()))]
    pub async fn update<T: DfuTransport + ?Sized>(
        &self,
        transport: &T,
        init: &[u8],
        firmware: &[u8],
    ) -> DfuResult<()> {
        if init.is_empty() {
            return Err(DfuError::MissingPayload("Init"));
        }
        if firmware.is_empty() {
            return Err(DfuError::MissingPayload("Firmware"));
        }
        self.abort.reset();

        let result = self.run_update(transport, init, firmware).await;
        if let Err(DfuError::Aborted) = result {
            self.set_state(DfuState::Aborted);
        }
        self.report(&result);
        result
    }

    async fn run_update<T: DfuTransport + ?Sized>(
        &self,
        transport: &T,
        init: &[u8],
        firmware: &[u8],
    ) -> DfuResult<()> {
        self.set_state(DfuState::Connecting);
        self.connect(transport).await?;

        let mut link = transport.link_state();
        let correlator = Arc::new(Correlator::new());

        let outcome = tokio::select! {
            biased;
            _ = link.wait_for(|connected| !*connected) => Err(DfuError::Disconnected),
            result = self.transfer_objects(transport, &correlator, init, firmware) => result,
        };

        match outcome {
            Ok(()) => {}
            Err(DfuError::Disconnected | DfuError::Transport(TransportError::Disconnected)) => {
                warn!("Device disconnected during update");
                self.clear_channels();
                correlator.clear();
                return Err(DfuError::Disconnected);
            }
            Err(err) => return Err(err),
        }

        self.set_state(DfuState::Disconnecting);
        transport.disconnect().await?;
        self.wait_for_disconnect(&mut link).await;
        self.clear_channels();

        self.set_state(DfuState::Completed);
        self.log(LogLevel::Info, "Update complete");
        Ok(())
    }

    async fn transfer_objects<T: DfuTransport + ?Sized>(
        &self,
        transport: &T,
        correlator: &Arc<Correlator>,
        init: &[u8],
        firmware: &[u8],
    ) -> DfuResult<()> {
        let channels = self.open_channels(transport, correlator).await?;
        let control = ControlPoint::new(
            transport,
            correlator,
            self.observer.as_ref(),
            channels.control,
            self.config.operation_timeout(),
        );
        let engine = ObjectTransfer::new(
            &control,
            channels.packet,
            &self.config,
            self.checksum,
            &self.abort,
            self.observer.as_ref(),
        );

        self.set_state(DfuState::Starting);
        engine.transfer(ObjectKind::Command, init).await?;

        self.set_state(DfuState::Uploading);
        engine.transfer(ObjectKind::Data, firmware).await?;
        Ok(())
    }

    async fn connect<T: DfuTransport + ?Sized>(&self, transport: &T) -> DfuResult<()> {
        match time::timeout(self.config.operation_timeout(), transport.connect()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DfuError::Timeout {
                operation: "Connect",
                timeout_ms: self.config.operation_timeout_ms,
            }),
        }
    }

    async fn discover<T: DfuTransport + ?Sized>(
        &self,
        transport: &T,
    ) -> DfuResult<Vec<GattCharacteristic>> {
        let service = match transport.discover_service(SERVICE_UUID).await {
            Ok(service) => service,
            Err(TransportError::ServiceNotFound(_)) => return Err(DfuError::ServiceNotFound),
            Err(e) => return Err(e.into()),
        };
        let characteristics = transport.discover_characteristics(&service).await?;
        debug!(count = characteristics.len(), "Discovered characteristics");
        Ok(characteristics)
    }

    async fn open_channels<T: DfuTransport + ?Sized>(
        &self,
        transport: &T,
        correlator: &Arc<Correlator>,
    ) -> DfuResult<DfuChannels> {
        let characteristics = self.discover(transport).await?;
        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid);

        let packet = find(PACKET_UUID).ok_or(DfuError::CharacteristicNotFound("packet"))?;
        let control = find(CONTROL_UUID).ok_or(DfuError::CharacteristicNotFound("control"))?;
        if !control.supports_notifications() {
            return Err(DfuError::NotificationsUnsupported("control"));
        }

        let sink = Arc::clone(correlator);
        let handler: NotificationHandler = Arc::new(move |data: &[u8]| sink.dispatch(data));
        transport.subscribe(control.uuid, handler).await?;

        let channels = DfuChannels {
            control: control.uuid,
            packet: packet.uuid,
        };
        self.session().channels = Some(channels);
        self.log(LogLevel::Info, "DFU channels ready");
        Ok(channels)
    }

    /// Wait (bounded) for the link to drop. Returns `false` on timeout.
    async fn wait_for_disconnect(&self, link: &mut watch::Receiver<bool>) -> bool {
        let timeout = self.config.disconnect_timeout();
        match time::timeout(timeout, link.wait_for(|connected| !*connected)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_ms = self.config.disconnect_timeout_ms,
                    "Device did not disconnect"
                );
                false
            }
        }
    }

    /// Reboot a device running its application into the bootloader.
    ///
    /// Succeeds immediately when the device already exposes the DFU
    /// control and packet characteristics.
    #[instrument(skip_all)]
    pub async fn set_dfu_mode<T: DfuTransport + ?Sized>(&self, transport: &T) -> DfuResult<()> {
        let result = self.switch_to_bootloader(transport).await;
        self.report(&result);
        result
    }

    async fn switch_to_bootloader<T: DfuTransport + ?Sized>(&self, transport: &T) -> DfuResult<()> {
        self.connect(transport).await?;
        let characteristics = self.discover(transport).await?;
        let has = |uuid: Uuid| characteristics.iter().any(|c| c.uuid == uuid);

        if has(CONTROL_UUID) && has(PACKET_UUID) {
            self.log(LogLevel::Info, "Device already in DFU mode");
            return Ok(());
        }

        let button = characteristics
            .iter()
            .find(|c| c.uuid == BUTTON_UUID)
            .ok_or(DfuError::UnsupportedDevice)?;
        if !button.supports_notifications() {
            return Err(DfuError::NotificationsUnsupported("button"));
        }

        let correlator = Arc::new(Correlator::new());
        let sink = Arc::clone(&correlator);
        let handler: NotificationHandler = Arc::new(move |data: &[u8]| sink.dispatch(data));
        transport.subscribe(BUTTON_UUID, handler).await?;

        let mut link = transport.link_state();
        let control = ControlPoint::new(
            transport,
            &correlator,
            self.observer.as_ref(),
            BUTTON_UUID,
            self.config.operation_timeout(),
        );

        self.log(LogLevel::Info, "Switching to DFU mode");
        tokio::select! {
            biased;
            result = control.request(Operation::ButtonCommand) => {
                result?;
            }
            _ = link.wait_for(|connected| !*connected) => {
                debug!("Device rebooted before acknowledging");
                return Ok(());
            }
        }

        if !self.wait_for_disconnect(&mut link).await {
            return Err(DfuError::Timeout {
                operation: "Reboot into DFU mode",
                timeout_ms: self.config.disconnect_timeout_ms,
            });
        }
        self.log(LogLevel::Info, "Device rebooted into DFU mode");
        Ok(())
    }
}
