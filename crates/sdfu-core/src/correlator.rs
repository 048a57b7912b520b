//! Request/response correlation on the control point.
//!
//! The bootloader answers every command with a notification echoing the
//! opcode, and at most one command per opcode is in flight. Each opcode
//! therefore owns a single slot holding the waiting sender.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{DfuError, DfuResult};
use crate::protocol::{Operation, ResponseFrame, opcode_name};

/// Slots cover opcodes 0x00..=0x07.
const SLOT_COUNT: usize = 8;

type Slot = Option<oneshot::Sender<DfuResult<Vec<u8>>>>;

/// Routes decoded response frames to the operation waiting for them.
pub struct Correlator {
    slots: Mutex<[Slot; SLOT_COUNT]>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Default::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, [Slot; SLOT_COUNT]> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the slot for `operation`. Must happen before the frame is written.
    pub fn register(&self, operation: &Operation) -> DfuResult<PendingOperation<'_>> {
        let opcode = operation.opcode();
        let index = opcode as usize;
        let mut slots = self.slots();
        let slot = slots
            .get_mut(index)
            .ok_or(DfuError::OperationPending(opcode))?;
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(DfuError::OperationPending(opcode));
        }

        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(PendingOperation {
            correlator: self,
            index,
            rx,
        })
    }

    /// Feed one notification from the control characteristic.
    pub fn dispatch(&self, data: &[u8]) {
        let frame = match ResponseFrame::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, data = ?data, "Dropping undecodable response");
                self.fail_all(|| DfuError::Protocol(err.clone()));
                return;
            }
        };

        let opcode = frame.opcode;
        let sender = self
            .slots()
            .get_mut(opcode as usize)
            .and_then(|slot| slot.take());
        match sender {
            Some(tx) => {
                let result = frame
                    .outcome
                    .map_err(|reason| DfuError::Rejected { opcode, reason });
                let _ = tx.send(result);
            }
            None => {
                debug!(
                    opcode = %format!("0x{:02X}", opcode),
                    name = opcode_name(opcode),
                    "Unmatched response notification"
                );
            }
        }
    }

    /// Fail every outstanding operation; used when the link drops.
    pub fn clear(&self) {
        self.fail_all(|| DfuError::Disconnected);
    }

    /// Number of armed slots.
    pub fn pending(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
            .count()
    }

    fn fail_all(&self, error: impl Fn() -> DfuError) {
        let senders: Vec<_> = self.slots().iter_mut().filter_map(Option::take).collect();
        for tx in senders {
            let _ = tx.send(Err(error()));
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered operation awaiting its response.
///
/// Dropping it (timeout, cancellation) releases the slot.
pub struct PendingOperation<'a> {
    correlator: &'a Correlator,
    index: usize,
    rx: oneshot::Receiver<DfuResult<Vec<u8>>>,
}

impl PendingOperation<'_> {
    /// Wait for the payload of a successful response.
    pub async fn response(&mut self) -> DfuResult<Vec<u8>> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(DfuError::Disconnected),
        }
    }
}

impl Drop for PendingOperation<'_> {
    fn drop(&mut self) {
        self.rx.close();
        let mut slots = self.correlator.slots();
        if let Some(slot) = slots.get_mut(self.index)
            && slot.as_ref().is_some_and(|tx| tx.is_closed())
        {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ObjectKind, Rejection, ResultCode};

    #[tokio::test]
    async fn test_dispatch_fulfils_matching_slot() {
        let correlator = Correlator::new();
        let mut pending = correlator.register(&Operation::CalculateChecksum).unwrap();

        correlator.dispatch(&[0x60, 0x03, 0x01, 0xAA, 0xBB]);

        assert_eq!(pending.response().await.unwrap(), vec![0xAA, 0xBB]);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_rejection_maps_to_error() {
        let correlator = Correlator::new();
        let mut pending = correlator
            .register(&Operation::Create {
                kind: ObjectKind::Data,
                size: 4096,
            })
            .unwrap();

        correlator.dispatch(&[0x60, 0x01, 0x04]);

        match pending.response().await {
            Err(DfuError::Rejected { opcode, reason }) => {
                assert_eq!(opcode, 0x01);
                assert_eq!(
                    reason,
                    Rejection::Result(ResultCode::InsufficientResources)
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_single_slot_per_opcode() {
        let correlator = Correlator::new();
        let first = correlator.register(&Operation::Execute).unwrap();
        assert!(matches!(
            correlator.register(&Operation::Execute),
            Err(DfuError::OperationPending(0x04))
        ));
        // Other opcodes are independent.
        let _select = correlator
            .register(&Operation::Select(ObjectKind::Command))
            .unwrap();

        drop(first);
        assert!(correlator.register(&Operation::Execute).is_ok());
    }

    #[test]
    fn test_drop_releases_slot() {
        let correlator = Correlator::new();
        {
            let _pending = correlator.register(&Operation::Execute).unwrap();
            assert_eq!(correlator.pending(), 1);
        }
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_notification_is_dropped() {
        let correlator = Correlator::new();
        let mut pending = correlator.register(&Operation::Execute).unwrap();

        correlator.dispatch(&[0x60, 0x03, 0x01]);
        assert_eq!(correlator.pending(), 1);

        correlator.dispatch(&[0x60, 0x04, 0x01]);
        assert!(pending.response().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognised_frame_fails_pending() {
        let correlator = Correlator::new();
        let mut pending = correlator.register(&Operation::Execute).unwrap();

        correlator.dispatch(&[0x10, 0x04, 0x01]);

        assert!(matches!(
            pending.response().await,
            Err(DfuError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_fails_with_disconnect() {
        let correlator = Correlator::new();
        let mut pending = correlator.register(&Operation::CalculateChecksum).unwrap();

        correlator.clear();

        assert!(matches!(
            pending.response().await,
            Err(DfuError::Disconnected)
        ));
        assert_eq!(correlator.pending(), 0);
    }
}
