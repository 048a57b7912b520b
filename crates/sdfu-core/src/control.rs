//! Control point: command writes paired with their response notifications.

use std::time::Duration;

use tokio::time;
use tracing::debug;
use uuid::Uuid;

use crate::correlator::Correlator;
use crate::error::{DfuError, DfuResult};
use crate::events::{DfuEvent, DfuObserver};
use crate::protocol::{ChecksumResponse, ObjectKind, Operation, SelectResponse};
use crate::transport::DfuTransport;

/// Sends commands on one characteristic and waits for the correlated reply.
pub struct ControlPoint<'a, T: DfuTransport + ?Sized> {
    transport: &'a T,
    correlator: &'a Correlator,
    observer: &'a dyn DfuObserver,
    characteristic: Uuid,
    timeout: Duration,
}

impl<'a, T: DfuTransport + ?Sized> ControlPoint<'a, T> {
    pub fn new(
        transport: &'a T,
        correlator: &'a Correlator,
        observer: &'a dyn DfuObserver,
        characteristic: Uuid,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            correlator,
            observer,
            characteristic,
            timeout,
        }
    }

    /// Write `operation` and wait for its response payload.
    ///
    /// The write and the wait share one timeout. Rejections are also
    /// reported to the observer.
    pub async fn request(&self, operation: Operation) -> DfuResult<Vec<u8>> {
        let mut pending = self.correlator.register(&operation)?;
        let frame = operation.encode();
        debug!(operation = %operation, frame = ?frame, "Sending control command");

        let exchange = async {
            match self.transport.write(self.characteristic, &frame, true).await {
                Ok(()) => pending.response().await,
                Err(e) => Err(e.into()),
            }
        };

        let result = match time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DfuError::Timeout {
                operation: operation.name(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        if let Err(err @ DfuError::Rejected { .. }) = &result {
            self.observer.on_event(&DfuEvent::Error {
                detail: err.to_string(),
            });
        }
        result
    }

    pub async fn select(&self, kind: ObjectKind) -> DfuResult<SelectResponse> {
        let payload = self.request(Operation::Select(kind)).await?;
        Ok(SelectResponse::from_payload(&payload)?)
    }

    pub async fn create(&self, kind: ObjectKind, size: u32) -> DfuResult<()> {
        self.request(Operation::Create { kind, size }).await?;
        Ok(())
    }

    pub async fn calculate_checksum(&self) -> DfuResult<ChecksumResponse> {
        let payload = self.request(Operation::CalculateChecksum).await?;
        Ok(ChecksumResponse::from_payload(&payload)?)
    }

    pub async fn execute(&self) -> DfuResult<()> {
        self.request(Operation::Execute).await?;
        Ok(())
    }

    /// Write one packet-characteristic chunk under the same timeout.
    pub async fn write_packet(
        &self,
        packet: Uuid,
        chunk: &[u8],
        with_response: bool,
    ) -> DfuResult<()> {
        match time::timeout(
            self.timeout,
            self.transport.write(packet, chunk, with_response),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(DfuError::Timeout {
                operation: "Packet write",
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::ChannelObserver;
    use crate::protocol::constants::*;
    use crate::transport::{MockTransport, NotificationHandler};

    async fn connected(mock: &MockTransport, correlator: &Arc<Correlator>) {
        mock.connect().await.unwrap();
        let sink = Arc::clone(correlator);
        let handler: NotificationHandler = Arc::new(move |data: &[u8]| sink.dispatch(data));
        mock.subscribe(CONTROL_UUID, handler).await.unwrap();
    }

    #[tokio::test]
    async fn test_select_round_trip() {
        let mock = MockTransport::new();
        let correlator = Arc::new(Correlator::new());
        connected(&mock, &correlator).await;
        let (observer, _rx) = ChannelObserver::new();
        let control = ControlPoint::new(
            &mock,
            &correlator,
            &observer,
            CONTROL_UUID,
            Duration::from_secs(5),
        );

        let select = control.select(ObjectKind::Data).await.unwrap();
        assert_eq!(select.max_size, 4096);
        assert_eq!(select.offset, 0);
        assert_eq!(mock.control_writes(), vec![vec![0x06, 0x02]]);
    }

    #[tokio::test]
    async fn test_rejection_emits_error_event() {
        let mock = MockTransport::new();
        mock.reject(OP_EXECUTE, RESULT_OPERATION_NOT_PERMITTED);
        let correlator = Arc::new(Correlator::new());
        connected(&mock, &correlator).await;
        let (observer, mut rx) = ChannelObserver::new();
        let control = ControlPoint::new(
            &mock,
            &correlator,
            &observer,
            CONTROL_UUID,
            Duration::from_secs(5),
        );

        let err = control.execute().await.unwrap_err();
        assert_eq!(err.to_string(), "Execute failed: Operation not permitted");
        assert_eq!(
            rx.try_recv().unwrap(),
            DfuEvent::Error {
                detail: "Execute failed: Operation not permitted".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_and_releases_slot() {
        let mock = MockTransport::new();
        mock.silence(OP_CALCULATE_CHECKSUM);
        let correlator = Arc::new(Correlator::new());
        connected(&mock, &correlator).await;
        let (observer, _rx) = ChannelObserver::new();
        let control = ControlPoint::new(
            &mock,
            &correlator,
            &observer,
            CONTROL_UUID,
            Duration::from_millis(5000),
        );

        let err = control.calculate_checksum().await.unwrap_err();
        assert!(matches!(
            err,
            DfuError::Timeout {
                operation: "Calculate checksum",
                timeout_ms: 5000
            }
        ));
        assert_eq!(correlator.pending(), 0);
    }
}
