//! Object transfer engine.
//!
//! Moves one object (init packet or firmware image) onto the device:
//! Select, reconcile with what the device already holds, then for every
//! page Create, stream packets, Calculate checksum and Execute. Checksum
//! mismatches retry the page from its start; lost tail bytes are resent
//! without a new Create.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::config::SessionConfig;
use crate::control::ControlPoint;
use crate::error::{DfuError, DfuResult};
use crate::events::{DfuEvent, DfuObserver, LogLevel};
use crate::payload::{Resumption, TransferObject, packets};
use crate::protocol::ObjectKind;
use crate::transport::DfuTransport;

/// Cooperative cancellation flag, checked before Select and before each page.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Transfers objects over an open control point and packet characteristic.
pub struct ObjectTransfer<'a, T: DfuTransport + ?Sized> {
    control: &'a ControlPoint<'a, T>,
    packet: Uuid,
    config: &'a SessionConfig,
    checksum: Checksum,
    abort: &'a AbortHandle,
    observer: &'a dyn DfuObserver,
}

impl<'a, T: DfuTransport + ?Sized> ObjectTransfer<'a, T> {
    pub fn new(
        control: &'a ControlPoint<'a, T>,
        packet: Uuid,
        config: &'a SessionConfig,
        checksum: Checksum,
        abort: &'a AbortHandle,
        observer: &'a dyn DfuObserver,
    ) -> Self {
        Self {
            control,
            packet,
            config,
            checksum,
            abort,
            observer,
        }
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

    fn check_abort(&self) -> DfuResult<()> {
        if self.abort.is_aborted() {
            info!("Abort requested");
            return Err(DfuError::Aborted);
        }
        Ok(())
    }

    fn attempts(&self, kind: ObjectKind) -> u32 {
        let attempts = match kind {
            ObjectKind::Command => self.config.init_attempts,
            ObjectKind::Data => self.config.firmware_attempts,
        };
        attempts.max(1)
    }

    fn progress(&self, kind: ObjectKind, current: u64, total: u64) {
        self.emit(DfuEvent::Progress {
            object: kind.into(),
            current,
            total,
        });
    }

    /// Transfer `data` as an object of `kind` and leave it executed.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn transfer(&self, kind: ObjectKind, data: &[u8]) -> DfuResult<()> {
        self.check_abort()?;

        let select = self.control.select(kind).await?;
        debug!(
            max_size = select.max_size,
            offset = select.offset,
            crc = %format!("0x{:08X}", select.crc),
            "Selected {}",
            kind
        );
        if select.max_size == 0 {
            return Err(DfuError::InvalidMaxSize { object: kind });
        }
        if kind == ObjectKind::Command && data.len() > select.max_size as usize {
            return Err(DfuError::InitPacketTooLarge {
                size: data.len(),
                max_size: select.max_size,
            });
        }

        let object = TransferObject::new(kind, data, select);
        let len = object.len();
        let resumption = if kind == ObjectKind::Command && self.config.force_init {
            Resumption::Fresh
        } else {
            object.reconcile(&self.checksum)
        };

        let mut executed = false;
        let (mut offset, mut resuming) = match resumption {
            Resumption::Fresh => {
                self.log(LogLevel::Info, format!("Sending {} ({} bytes)", kind, len));
                (0, false)
            }
            Resumption::Resume { offset } => {
                self.log(
                    LogLevel::Info,
                    format!("Resuming {} at offset {} of {}", kind, offset, len),
                );
                (offset, true)
            }
            Resumption::ExecutePending { offset } => {
                self.log(
                    LogLevel::Info,
                    format!("Executing {} page ending at {}", kind, offset),
                );
                self.control.execute().await?;
                executed = true;
                (offset, false)
            }
            Resumption::Complete => {
                self.log(LogLevel::Info, format!("{} already on the device", kind));
                (len, false)
            }
        };
        self.progress(kind, offset as u64, len as u64);

        let attempts = self.attempts(kind);
        let mut failures = 0u32;

        while offset < len {
            self.check_abort()?;

            let page = object.page(offset);
            if !resuming {
                self.control.create(kind, page.len()).await?;
            }
            self.send_packets(kind, data, offset, page.end).await?;

            let reported = self.control.calculate_checksum().await?;
            let transferred = reported.offset;
            if transferred > page.end {
                return Err(DfuError::OffsetOutOfRange {
                    offset: transferred,
                    end: page.end,
                });
            }

            if !self
                .checksum
                .matches(&data[..transferred as usize], reported.crc)
            {
                failures += 1;
                if failures >= attempts {
                    self.emit(DfuEvent::Error {
                        detail: format!("CRC doesn't match for the {}", kind),
                    });
                    return Err(DfuError::ChecksumMismatch {
                        object: kind,
                        attempts,
                    });
                }
                warn!(attempt = failures, page = page.start, "CRC mismatch, resending page");
                self.log(
                    LogLevel::Warn,
                    format!("CRC doesn't match, retrying page at {}", page.start),
                );
                offset = page.start;
                resuming = false;
                continue;
            }

            if transferred < page.end {
                if transferred <= offset {
                    failures += 1;
                    if failures >= attempts {
                        return Err(DfuError::Stalled {
                            object: kind,
                            offset: transferred,
                        });
                    }
                }
                warn!(
                    lost = page.end - transferred,
                    offset = transferred,
                    "Bytes lost, resuming"
                );
                offset = transferred;
                resuming = true;
                continue;
            }

            self.control.execute().await?;
            debug!(start = page.start, end = page.end, "Page executed");
            executed = true;
            failures = 0;
            offset = transferred;
            resuming = false;
        }

        // The whole object may already have been on the device.
        if !executed {
            self.control.execute().await?;
        }

        self.log(LogLevel::Info, format!("{} transferred", kind));
        Ok(())
    }

    async fn send_packets(
        &self,
        kind: ObjectKind,
        data: &[u8],
        from: u32,
        to: u32,
    ) -> DfuResult<()> {
        let total = data.len() as u64;
        let mut sent = from as u64;
        for chunk in packets(&data[from as usize..to as usize]) {
            self.control
                .write_packet(self.packet, chunk, self.config.packet_write_with_response)
                .await?;
            sent += chunk.len() as u64;
            self.progress(kind, sent, total);
        }
        Ok(())
    }
}
