/// Bounded-wait characteristic writes
///
/// Turns the platform's asynchronous "write completed" callback into an
/// awaitable call with a timeout. Every write gets a correlation id; the
/// completion callback resolves only the waiter registered under that id, so
/// a late completion for a timed-out write is dropped instead of satisfying
/// the next write. Writes to the same session are serialised through a
/// per-address lane, since a GATT link accepts one outstanding
/// write-with-response at a time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::gatt::Session;
use super::platform::{GattClientPlatform, PlatformError, WriteCallback};
use crate::transport::abstraction::BleError;

enum WriteOutcome {
    Completed(Result<(), PlatformError>),
    Revoked(&'static str),
}

struct PendingWrite {
    address: String,
    tx: oneshot::Sender<WriteOutcome>,
}

type WaiterMap = Arc<Mutex<HashMap<u64, PendingWrite>>>;

pub struct WriteSynchronizer {
    platform: Arc<dyn GattClientPlatform>,
    timeout: Duration,
    next_id: AtomicU64,
    waiters: WaiterMap,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    closed: AtomicBool,
}

impl WriteSynchronizer {
    pub fn new(platform: Arc<dyn GattClientPlatform>, timeout: Duration) -> Self {
        Self {
            platform,
            timeout,
            next_id: AtomicU64::new(1),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            lanes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of writes currently waiting for a completion
    pub fn outstanding(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Write `data` to the session's request characteristic and wait for the
    /// platform to confirm it.
    ///
    /// Returns `SendFailed` if no completion arrives within the timeout and
    /// `Failed` if the stack rejects the write or the wait is revoked.
    pub async fn write_and_wait(&self, session: &Session, data: &[u8]) -> Result<(), BleError> {
        if data.is_empty() {
            return Err(BleError::InvalidParam("payload is empty".to_string()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BleError::Failed("adapter is stopped".to_string()));
        }

        let lane = self.lane(&session.remote_address);
        let _lane_guard = lane.lock().await;

        self.platform
            .set_characteristic_value(session.request_characteristic, data)
            .await
            .map_err(|e| {
                warn!(address = %session.remote_address, "Failed to set characteristic value: {}", e);
                BleError::from(e)
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(
            id,
            PendingWrite {
                address: session.remote_address.clone(),
                tx,
            },
        );

        let waiters = self.waiters.clone();
        let on_complete: WriteCallback = Box::new(move |result| {
            let pending = waiters.lock().remove(&id);
            match pending {
                Some(pending) => {
                    let _ = pending.tx.send(WriteOutcome::Completed(result));
                }
                None => debug!(id, "Ignoring completion for a write that is no longer awaited"),
            }
        });

        if let Err(e) = self
            .platform
            .write_characteristic(session.request_characteristic, on_complete)
            .await
        {
            self.waiters.lock().remove(&id);
            warn!(address = %session.remote_address, "Write request rejected: {}", e);
            return Err(e.into());
        }

        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.waiters.lock().remove(&id);

        match outcome {
            Ok(Ok(WriteOutcome::Completed(Ok(())))) => {
                debug!(address = %session.remote_address, len = data.len(), "Write completed");
                Ok(())
            }
            Ok(Ok(WriteOutcome::Completed(Err(e)))) => {
                warn!(address = %session.remote_address, "Write failed: {}", e);
                Err(BleError::Failed(format!("write failed: {}", e)))
            }
            Ok(Ok(WriteOutcome::Revoked(reason))) => Err(BleError::Failed(reason.to_string())),
            Ok(Err(_)) => Err(BleError::Failed("write waiter dropped".to_string())),
            Err(_) => {
                warn!(
                    address = %session.remote_address,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "No write completion before timeout"
                );
                Err(BleError::SendFailed(format!(
                    "no write completion within {} ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }

    /// Fail every outstanding write to `address` and drop its lane
    pub fn revoke_address(&self, address: &str) {
        let revoked: Vec<PendingWrite> = {
            let mut waiters = self.waiters.lock();
            let ids: Vec<u64> = waiters
                .iter()
                .filter(|(_, pending)| pending.address == address)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| waiters.remove(&id)).collect()
        };
        for pending in revoked {
            let _ = pending.tx.send(WriteOutcome::Revoked("peer disconnected"));
        }
        self.lanes.lock().remove(address);
    }

    /// Fail every outstanding write and refuse new ones until `reopen`
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<PendingWrite> = self.waiters.lock().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Revoking outstanding writes");
        }
        for pending in drained {
            let _ = pending.tx.send(WriteOutcome::Revoked("adapter is stopped"));
        }
        self.lanes.lock().clear();
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn lane(&self, address: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lanes
            .lock()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
