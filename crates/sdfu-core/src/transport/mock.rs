//! Mock BLE transport for testing.
//!
//! Simulates a Secure DFU bootloader in memory: command and data objects,
//! CRC-32 over received bytes, executes, and a log of every write. Replies
//! are delivered synchronously from inside `write`, before it returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use super::traits::{
    DfuTransport, GattCharacteristic, GattService, NotificationHandler, TransportError,
};
use crate::checksum::crc32_ieee;
use crate::protocol::constants::*;

/// Default command object size limit.
pub const MOCK_COMMAND_MAX_SIZE: u32 = 256;
/// Default data object (page) size.
pub const MOCK_DATA_MAX_SIZE: u32 = 4096;

/// A write captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub with_response: bool,
}

#[derive(Debug, Clone, Default)]
struct ObjectState {
    max_size: u32,
    received: Vec<u8>,
    executed_len: usize,
}

#[derive(Default)]
struct Faults {
    corrupt_checksums: u32,
    lose_tail_bytes: Option<usize>,
    inflate_checksum_offset: u32,
    disconnect_after_packets: Option<usize>,
    silent: Vec<u8>,
    rejections: HashMap<u8, Vec<u8>>,
}

struct Bootloader {
    has_service: bool,
    characteristics: Vec<GattCharacteristic>,
    handlers: HashMap<Uuid, NotificationHandler>,
    command: ObjectState,
    data: ObjectState,
    current: Option<u8>,
    executes: Vec<u8>,
    packets: usize,
    link_lost: bool,
    faults: Faults,
    log: Vec<MockWrite>,
}

enum Reaction {
    None,
    Notify(Uuid, Vec<u8>),
    NotifyThenDisconnect(Uuid, Vec<u8>),
    DropLink,
}

impl Bootloader {
    fn object_mut(&mut self, object_type: u8) -> Option<&mut ObjectState> {
        match object_type {
            OBJECT_COMMAND => Some(&mut self.command),
            OBJECT_DATA => Some(&mut self.data),
            _ => None,
        }
    }

    fn receive_packet(&mut self, data: &[u8]) -> Reaction {
        self.packets += 1;
        if let Some(object_type) = self.current
            && let Some(object) = self.object_mut(object_type)
        {
            object.received.extend_from_slice(data);
        }
        match self.faults.disconnect_after_packets {
            Some(limit) if self.packets >= limit => {
                self.faults.disconnect_after_packets = None;
                Reaction::DropLink
            }
            _ => Reaction::None,
        }
    }

    fn handle_control(&mut self, frame: &[u8]) -> Reaction {
        let Some(&opcode) = frame.first() else {
            return Reaction::None;
        };
        if self.faults.silent.contains(&opcode) {
            return Reaction::None;
        }

        let mut response = vec![RESPONSE_TAG, opcode];
        if let Some(result) = self.faults.rejections.get(&opcode) {
            response.extend_from_slice(result);
            return Reaction::Notify(CONTROL_UUID, response);
        }

        match self.execute_control(opcode, frame) {
            Ok(payload) => {
                response.push(RESULT_SUCCESS);
                response.extend_from_slice(&payload);
            }
            Err(code) => response.push(code),
        }
        Reaction::Notify(CONTROL_UUID, response)
    }

    fn handle_button(&mut self, frame: &[u8]) -> Reaction {
        let Some(&opcode) = frame.first() else {
            return Reaction::None;
        };
        let mut response = vec![BUTTONLESS_RESPONSE_TAG, opcode];
        if let Some(result) = self.faults.rejections.get(&opcode) {
            response.extend_from_slice(result);
            return Reaction::Notify(BUTTON_UUID, response);
        }
        if opcode != OP_BUTTON {
            response.push(RESULT_OPCODE_NOT_SUPPORTED);
            return Reaction::Notify(BUTTON_UUID, response);
        }
        // Acknowledge, then reboot into the bootloader.
        response.push(RESULT_SUCCESS);
        Reaction::NotifyThenDisconnect(BUTTON_UUID, response)
    }

    fn execute_control(&mut self, opcode: u8, frame: &[u8]) -> Result<Vec<u8>, u8> {
        let mut payload = Vec::new();
        match opcode {
            OP_SELECT => {
                let object_type = *frame.get(1).ok_or(RESULT_INVALID_PARAMETER)?;
                let object = self
                    .object_mut(object_type)
                    .ok_or(RESULT_UNSUPPORTED_TYPE)?;
                payload.extend_from_slice(&object.max_size.to_le_bytes());
                payload.extend_from_slice(&(object.received.len() as u32).to_le_bytes());
                payload.extend_from_slice(&crc32_ieee(&object.received).to_le_bytes());
                self.current = Some(object_type);
            }
            OP_CREATE => {
                if frame.len() < 6 {
                    return Err(RESULT_INVALID_PARAMETER);
                }
                let object_type = frame[1];
                let size = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
                let object = self
                    .object_mut(object_type)
                    .ok_or(RESULT_UNSUPPORTED_TYPE)?;
                if size > object.max_size {
                    return Err(RESULT_INSUFFICIENT_RESOURCES);
                }
                if object_type == OBJECT_COMMAND {
                    object.received.clear();
                    object.executed_len = 0;
                } else {
                    let executed = object.executed_len;
                    object.received.truncate(executed);
                }
                self.current = Some(object_type);
            }
            OP_RECEIPT_NOTIFICATIONS => {}
            OP_CALCULATE_CHECKSUM => {
                let object_type = self.current.ok_or(RESULT_OPERATION_NOT_PERMITTED)?;
                let lose = self.faults.lose_tail_bytes.take();
                let inflate = self.faults.inflate_checksum_offset;
                let corrupt = if self.faults.corrupt_checksums > 0 {
                    self.faults.corrupt_checksums -= 1;
                    true
                } else {
                    false
                };
                let object = self
                    .object_mut(object_type)
                    .ok_or(RESULT_OPERATION_NOT_PERMITTED)?;
                if let Some(lost) = lose {
                    let keep = object
                        .received
                        .len()
                        .saturating_sub(lost)
                        .max(object.executed_len);
                    object.received.truncate(keep);
                }
                let mut crc = crc32_ieee(&object.received);
                if corrupt {
                    crc ^= 0x0000_0100;
                }
                let offset = object.received.len() as u32 + inflate;
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
            }
            OP_EXECUTE => {
                let object_type = self.current.ok_or(RESULT_OPERATION_NOT_PERMITTED)?;
                let object = self
                    .object_mut(object_type)
                    .ok_or(RESULT_OPERATION_NOT_PERMITTED)?;
                object.executed_len = object.received.len();
                self.executes.push(object_type);
            }
            _ => return Err(RESULT_OPCODE_NOT_SUPPORTED),
        }
        Ok(payload)
    }
}

/// Simulated Secure DFU bootloader for unit and integration tests.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<Bootloader>>,
    link: Arc<watch::Sender<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (link, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(Bootloader {
                has_service: true,
                characteristics: vec![
                    GattCharacteristic::notifying(CONTROL_UUID),
                    GattCharacteristic::plain(PACKET_UUID),
                ],
                handlers: HashMap::new(),
                command: ObjectState {
                    max_size: MOCK_COMMAND_MAX_SIZE,
                    ..Default::default()
                },
                data: ObjectState {
                    max_size: MOCK_DATA_MAX_SIZE,
                    ..Default::default()
                },
                current: None,
                executes: Vec::new(),
                packets: 0,
                link_lost: false,
                faults: Faults::default(),
                log: Vec::new(),
            })),
            link: Arc::new(link),
        }
    }

    /// A device running its application, exposing only the buttonless characteristic.
    pub fn buttonless() -> Self {
        Self::new().with_characteristics(vec![GattCharacteristic::notifying(BUTTON_UUID)])
    }

    pub fn with_max_sizes(self, command: u32, data: u32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.command.max_size = command;
            state.data.max_size = data;
        }
        self
    }

    pub fn with_characteristics(self, characteristics: Vec<GattCharacteristic>) -> Self {
        self.state.lock().unwrap().characteristics = characteristics;
        self
    }

    pub fn without_service(self) -> Self {
        self.state.lock().unwrap().has_service = false;
        self
    }

    /// Pretend an earlier session left an init packet on the device.
    pub fn preload_command(&self, bytes: &[u8], executed: bool) {
        let mut state = self.state.lock().unwrap();
        state.command.received = bytes.to_vec();
        state.command.executed_len = if executed { bytes.len() } else { 0 };
    }

    /// Pretend an earlier session left firmware bytes on the device.
    pub fn preload_data(&self, bytes: &[u8], executed_len: usize) {
        let mut state = self.state.lock().unwrap();
        state.data.received = bytes.to_vec();
        state.data.executed_len = executed_len.min(bytes.len());
    }

    /// Flip a bit in the next `count` checksum replies.
    pub fn corrupt_checksums(&self, count: u32) {
        self.state.lock().unwrap().faults.corrupt_checksums = count;
    }

    /// Discard the last `count` received bytes before the next checksum reply.
    pub fn lose_tail_bytes(&self, count: usize) {
        self.state.lock().unwrap().faults.lose_tail_bytes = Some(count);
    }

    /// Report `extra` more bytes than received in every checksum reply.
    pub fn inflate_checksum_offset(&self, extra: u32) {
        self.state.lock().unwrap().faults.inflate_checksum_offset = extra;
    }

    /// Drop the link on the `count`th packet write; that write never completes.
    pub fn disconnect_after_packets(&self, count: usize) {
        self.state.lock().unwrap().faults.disconnect_after_packets = Some(count);
    }

    /// Never answer `opcode`.
    pub fn silence(&self, opcode: u8) {
        self.state.lock().unwrap().faults.silent.push(opcode);
    }

    /// Answer `opcode` with a failure result code.
    pub fn reject(&self, opcode: u8, result: u8) {
        self.state
            .lock()
            .unwrap()
            .faults
            .rejections
            .insert(opcode, vec![result]);
    }

    /// Answer `opcode` with an extended error.
    pub fn reject_extended(&self, opcode: u8, extended: u8) {
        self.state
            .lock()
            .unwrap()
            .faults
            .rejections
            .insert(opcode, vec![RESULT_EXTENDED_ERROR, extended]);
    }

    /// Deliver a raw notification on `characteristic`.
    pub fn notify(&self, characteristic: Uuid, data: &[u8]) {
        let handler = self
            .state
            .lock()
            .unwrap()
            .handlers
            .get(&characteristic)
            .cloned();
        if let Some(handler) = handler {
            handler(data);
        }
    }

    /// Simulate the device dropping the link.
    pub fn drop_link(&self) {
        self.link.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        *self.link.borrow()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<MockWrite> {
        self.state.lock().unwrap().log.clone()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// First byte of every control point write, in order.
    pub fn control_opcodes(&self) -> Vec<u8> {
        self.get_writes()
            .into_iter()
            .filter(|w| w.characteristic == CONTROL_UUID)
            .filter_map(|w| w.data.first().copied())
            .collect()
    }

    /// Full control point frames, in order.
    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.get_writes()
            .into_iter()
            .filter(|w| w.characteristic == CONTROL_UUID)
            .map(|w| w.data)
            .collect()
    }

    /// Packet characteristic writes, in order.
    pub fn packet_writes(&self) -> Vec<MockWrite> {
        self.get_writes()
            .into_iter()
            .filter(|w| w.characteristic == PACKET_UUID)
            .collect()
    }

    pub fn command_object(&self) -> Vec<u8> {
        self.state.lock().unwrap().command.received.clone()
    }

    pub fn data_object(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.received.clone()
    }

    /// Bytes of the data object covered by an Execute.
    pub fn data_executed_len(&self) -> usize {
        self.state.lock().unwrap().data.executed_len
    }

    /// Object type byte of every Execute, in order.
    pub fn executes(&self) -> Vec<u8> {
        self.state.lock().unwrap().executes.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DfuTransport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.state.lock().unwrap().link_lost = false;
        self.link.send_replace(true);
        Ok(())
    }

    async fn discover_service(&self, uuid: Uuid) -> Result<GattService, TransportError> {
        let state = self.state.lock().unwrap();
        if state.has_service && uuid == SERVICE_UUID {
            Ok(GattService { uuid })
        } else {
            Err(TransportError::ServiceNotFound(uuid))
        }
    }

    async fn discover_characteristics(
        &self,
        _service: &GattService,
    ) -> Result<Vec<GattCharacteristic>, TransportError> {
        Ok(self.state.lock().unwrap().characteristics.clone())
    }

    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let reaction = {
            let mut state = self.state.lock().unwrap();
            if state.link_lost {
                None
            } else if !*self.link.borrow() {
                return Err(TransportError::Disconnected);
            } else {
                state.log.push(MockWrite {
                    characteristic,
                    data: data.to_vec(),
                    with_response,
                });
                Some(match characteristic {
                    PACKET_UUID => state.receive_packet(data),
                    CONTROL_UUID => state.handle_control(data),
                    BUTTON_UUID => state.handle_button(data),
                    other => return Err(TransportError::CharacteristicNotFound(other)),
                })
            }
        };

        match reaction {
            None => {
                // The peer is gone; the write never completes.
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Reaction::DropLink) => {
                self.state.lock().unwrap().link_lost = true;
                self.link.send_replace(false);
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Reaction::None) => Ok(()),
            Some(Reaction::Notify(uuid, response)) => {
                self.notify(uuid, &response);
                Ok(())
            }
            Some(Reaction::NotifyThenDisconnect(uuid, response)) => {
                self.notify(uuid, &response);
                self.link.send_replace(false);
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        let found = state
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .copied()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))?;
        if !found.supports_notifications() {
            return Err(TransportError::SubscribeFailed(format!(
                "{} cannot notify",
                characteristic
            )));
        }
        state.handlers.insert(characteristic, handler);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.link.send_replace(false);
        Ok(())
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (NotificationHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: NotificationHandler = Arc::new(move |data: &[u8]| {
            sink.lock().unwrap().push(data.to_vec());
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_mock_select_reports_state() {
        let mock = MockTransport::new();
        mock.preload_data(&[1, 2, 3], 0);
        mock.connect().await.unwrap();
        let (handler, seen) = collector();
        mock.subscribe(CONTROL_UUID, handler).await.unwrap();

        mock.write(CONTROL_UUID, &[OP_SELECT, OBJECT_DATA], true)
            .await
            .unwrap();

        let reply = seen.lock().unwrap()[0].clone();
        assert_eq!(&reply[..3], &[RESPONSE_TAG, OP_SELECT, RESULT_SUCCESS]);
        assert_eq!(&reply[3..7], &MOCK_DATA_MAX_SIZE.to_le_bytes());
        assert_eq!(&reply[7..11], &3u32.to_le_bytes());
        assert_eq!(&reply[11..15], &crc32_ieee(&[1, 2, 3]).to_le_bytes());
    }

    #[tokio::test]
    async fn test_mock_create_discards_unexecuted_bytes() {
        let mock = MockTransport::new();
        mock.preload_data(&[0xAA; 30], 20);
        mock.connect().await.unwrap();
        let (handler, _seen) = collector();
        mock.subscribe(CONTROL_UUID, handler).await.unwrap();

        mock.write(CONTROL_UUID, &[OP_CREATE, OBJECT_DATA, 10, 0, 0, 0], true)
            .await
            .unwrap();
        assert_eq!(mock.data_object().len(), 20);

        mock.write(PACKET_UUID, &[0xBB; 10], false).await.unwrap();
        assert_eq!(mock.data_object().len(), 30);
        assert_eq!(mock.packet_writes().len(), 1);
        assert!(!mock.packet_writes()[0].with_response);
    }

    #[tokio::test]
    async fn test_mock_rejection() {
        let mock = MockTransport::new();
        mock.reject_extended(OP_EXECUTE, 0x08);
        mock.connect().await.unwrap();
        let (handler, seen) = collector();
        mock.subscribe(CONTROL_UUID, handler).await.unwrap();

        mock.write(CONTROL_UUID, &[OP_EXECUTE], true).await.unwrap();
        assert_eq!(
            seen.lock().unwrap()[0],
            vec![RESPONSE_TAG, OP_EXECUTE, RESULT_EXTENDED_ERROR, 0x08]
        );
    }

    #[tokio::test]
    async fn test_mock_disconnect() {
        let mock = MockTransport::new();
        assert!(!mock.is_connected());
        mock.connect().await.unwrap();
        assert!(mock.is_connected());

        mock.drop_link();
        assert!(!mock.is_connected());
        assert!(mock.write(CONTROL_UUID, &[OP_EXECUTE], true).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_subscribe_requires_notify() {
        let mock = MockTransport::new();
        let (handler, _seen) = collector();
        assert!(mock.subscribe(PACKET_UUID, handler.clone()).await.is_err());
        assert!(mock.subscribe(BUTTON_UUID, handler).await.is_err());
    }
}
