/// Multicast payloads waiting for peers that are not connected yet
///
/// Every multicast send lands here. When a session finishes discovery the
/// whole queue is replayed to it as unicast writes. Entries are not removed by
/// a replay: each newly discovered session receives every queued payload, so
/// delivery is at-least-once and repeated discovery of one peer can deliver a
/// payload twice. The queue is cleared only when the scan cycle times out or
/// the adapter stops.

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::gatt::Session;
use super::write_sync::WriteSynchronizer;
use crate::transport::abstraction::BleError;

/// One buffered multicast payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayload {
    pub data: Vec<u8>,
}

impl PendingPayload {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct PendingSendQueue {
    payloads: Mutex<Vec<PendingPayload>>,
    capacity: usize,
}

impl PendingSendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            payloads: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Append a payload. Fails with `MemoryAllocation` once the queue is full.
    pub fn push(&self, data: &[u8]) -> Result<(), BleError> {
        if data.is_empty() {
            return Err(BleError::InvalidParam("payload is empty".to_string()));
        }
        let mut payloads = self.payloads.lock();
        if payloads.len() >= self.capacity {
            return Err(BleError::MemoryAllocation(format!(
                "pending multicast queue full ({} payloads)",
                self.capacity
            )));
        }
        payloads.push(PendingPayload {
            data: data.to_vec(),
        });
        debug!(queued = payloads.len(), len = data.len(), "Multicast payload queued");
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<PendingPayload> {
        self.payloads.lock().clone()
    }

    /// Replay every queued payload to `session`.
    ///
    /// Returns the payloads that could not be written, with their error.
    pub async fn flush_to(
        &self,
        session: &Session,
        writer: &WriteSynchronizer,
    ) -> Vec<(PendingPayload, BleError)> {
        let payloads = self.snapshot();
        if payloads.is_empty() {
            return Vec::new();
        }

        debug!(
            address = %session.remote_address,
            count = payloads.len(),
            "Replaying pending multicast payloads"
        );

        let mut failures = Vec::new();
        for payload in payloads {
            if let Err(e) = writer.write_and_wait(session, &payload.data).await {
                warn!(address = %session.remote_address, "Pending payload not delivered: {}", e);
                failures.push((payload, e));
            }
        }
        failures
    }

    /// Drop everything; returns how many payloads were discarded
    pub fn clear(&self) -> usize {
        let mut payloads = self.payloads.lock();
        let dropped = payloads.len();
        payloads.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedPlatform, WriteMode};
    use crate::transport::ble::gatt::{CharacteristicHandle, ClientHandle, ServiceHandle};
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> Session {
        Session {
            remote_address: "AA:00:00:00:00:01".to_string(),
            client: ClientHandle(1),
            service: ServiceHandle(2),
            request_characteristic: CharacteristicHandle(3),
            response_characteristic: CharacteristicHandle(4),
        }
    }

    #[test]
    fn test_push_validates_and_bounds() {
        let queue = PendingSendQueue::new(2);
        assert!(matches!(queue.push(b""), Err(BleError::InvalidParam(_))));
        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();
        assert!(matches!(queue.push(b"c"), Err(BleError::MemoryAllocation(_))));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear_reports_dropped() {
        let queue = PendingSendQueue::new(8);
        queue.push(b"a").unwrap();
        queue.push(b"b").unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_replays_in_order_and_keeps_entries() {
        let platform = Arc::new(SimulatedPlatform::new());
        let writer = WriteSynchronizer::new(platform.clone(), Duration::from_secs(1));
        let queue = PendingSendQueue::new(8);
        queue.push(b"one").unwrap();
        queue.push(b"two").unwrap();
        queue.push(b"three").unwrap();

        let failures = queue.flush_to(&session(), &writer).await;
        assert!(failures.is_empty());

        let values: Vec<Vec<u8>> = platform.writes().into_iter().map(|w| w.value).collect();
        assert_eq!(values, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_flush_collects_failures() {
        let platform = Arc::new(SimulatedPlatform::new());
        platform.set_write_mode(WriteMode::Reject);
        let writer = WriteSynchronizer::new(platform.clone(), Duration::from_secs(1));
        let queue = PendingSendQueue::new(8);
        queue.push(b"one").unwrap();
        queue.push(b"two").unwrap();

        let failures = queue.flush_to(&session(), &writer).await;
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].0.data, b"one".to_vec());
        assert!(matches!(failures[1].1, BleError::Failed(_)));
    }
}
