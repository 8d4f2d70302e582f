/// Client-role connection lifecycle
///
/// Drives one peer from "advertises our service" to a registered `Session`:
/// GATT connect, client handle creation, service and characteristic
/// resolution, notification subscription, registration, then a replay of the
/// pending multicast queue. Any failure along the way releases what was
/// acquired and disconnects the peer; nothing here retries.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::gatt::{normalize_address, ClientHandle, GattServiceDefinition, Session};
use super::pending::PendingSendQueue;
use super::platform::{GattClientPlatform, NotifyCallback, PlatformError};
use super::registry::SessionRegistry;
use super::write_sync::WriteSynchronizer;
use crate::transport::abstraction::{BleError, ListenerSlot};

/// Receives `(remote_address, value)` for every notification on a session's
/// response characteristic
pub type NotificationSink = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

const READY_CHANNEL_CAPACITY: usize = 32;

/// Marks an address as being discovered for as long as it lives
struct DiscoveryGuard<'a> {
    discovering: &'a Mutex<HashSet<String>>,
    address: String,
}

impl<'a> DiscoveryGuard<'a> {
    fn acquire(discovering: &'a Mutex<HashSet<String>>, address: &str) -> Option<Self> {
        if !discovering.lock().insert(address.to_string()) {
            return None;
        }
        Some(Self {
            discovering,
            address: address.to_string(),
        })
    }
}

impl Drop for DiscoveryGuard<'_> {
    fn drop(&mut self) {
        self.discovering.lock().remove(&self.address);
    }
}

pub struct ConnectionOrchestrator {
    platform: Arc<dyn GattClientPlatform>,
    sessions: Arc<SessionRegistry>,
    pending: Arc<PendingSendQueue>,
    writer: Arc<WriteSynchronizer>,
    listener: ListenerSlot,
    definition: GattServiceDefinition,
    auto_connect: bool,
    discovering: Mutex<HashSet<String>>,
    notification_sink: Mutex<Option<NotificationSink>>,
    ready_tx: broadcast::Sender<String>,
}

impl ConnectionOrchestrator {
    pub fn new(
        platform: Arc<dyn GattClientPlatform>,
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingSendQueue>,
        writer: Arc<WriteSynchronizer>,
        listener: ListenerSlot,
        definition: GattServiceDefinition,
        auto_connect: bool,
    ) -> Self {
        let (ready_tx, _) = broadcast::channel(READY_CHANNEL_CAPACITY);
        Self {
            platform,
            sessions,
            pending,
            writer,
            listener,
            definition,
            auto_connect,
            discovering: Mutex::new(HashSet::new()),
            notification_sink: Mutex::new(None),
            ready_tx,
        }
    }

    /// Route response-characteristic notifications of new sessions to `sink`
    pub fn set_notification_sink(&self, sink: NotificationSink) {
        *self.notification_sink.lock() = Some(sink);
    }

    /// Addresses whose session finished discovery and queue replay
    pub fn subscribe_ready(&self) -> broadcast::Receiver<String> {
        self.ready_tx.subscribe()
    }

    pub fn is_discovering(&self, address: &str) -> bool {
        self.discovering.lock().contains(address)
    }

    /// Bring up a GATT link to `address`.
    ///
    /// If the profile is already connected, discovery runs right away.
    /// Otherwise the platform connect is only requested here and the
    /// connection-state callback schedules discovery once the link is up.
    pub async fn connect(&self, address: &str) -> Result<(), BleError> {
        let address = normalize_address(address)?;

        match self.platform.is_profile_connected(&address).await {
            Ok(true) => {
                debug!(address = %address, "GATT profile already connected, discovering");
                return self.discover_services(&address).await.map(|_| ());
            }
            Ok(false) => {}
            Err(e) => debug!(address = %address, "Profile state unavailable: {}", e),
        }

        self.platform
            .connect(&address, self.auto_connect)
            .await
            .map_err(|e| {
                warn!(address = %address, "GATT connect failed: {}", e);
                BleError::Failed(format!("connect to {} failed: {}", address, e))
            })?;

        info!(address = %address, auto_connect = self.auto_connect, "GATT connect requested");
        Ok(())
    }

    /// Resolve the transport service on a connected peer, register the
    /// session and replay the pending multicast queue to it.
    ///
    /// Returns `Ok(None)` when discovery of the same address is already in
    /// progress elsewhere.
    pub async fn discover_services(&self, address: &str) -> Result<Option<Session>, BleError> {
        let address = normalize_address(address)?;
        let _guard = match DiscoveryGuard::acquire(&self.discovering, &address) {
            Some(guard) => guard,
            None => {
                debug!(address = %address, "Discovery already in progress");
                return Ok(None);
            }
        };

        let session = match self.sessions.find(&address) {
            Some(existing) => existing,
            None => self.establish_session(&address).await?,
        };

        self.flush_pending(&session).await;
        // No receivers is fine
        let _ = self.ready_tx.send(address);
        Ok(Some(session))
    }

    async fn establish_session(&self, address: &str) -> Result<Session, BleError> {
        let client = match self.platform.create_client(address).await {
            Ok(client) => client,
            Err(e) => {
                self.disconnect_quietly(address).await;
                return Err(step_failed("create GATT client", address, e));
            }
        };

        match self.resolve_session(address, client).await {
            Ok(session) => {
                info!(
                    address,
                    sessions = self.sessions.count(),
                    "GATT session established"
                );
                Ok(session)
            }
            Err(e) => {
                if let Err(destroy) = self.platform.destroy_client(client).await {
                    warn!(address, "Failed to destroy GATT client: {}", destroy);
                }
                self.disconnect_quietly(address).await;
                Err(e)
            }
        }
    }

    async fn resolve_session(
        &self,
        address: &str,
        client: ClientHandle,
    ) -> Result<Session, BleError> {
        let service = self
            .platform
            .discover_service(client, &self.definition.service)
            .await
            .map_err(|e| step_failed("discover service", address, e))?;
        let request_characteristic = self
            .platform
            .discover_characteristic(service, &self.definition.request_characteristic)
            .await
            .map_err(|e| step_failed("discover request characteristic", address, e))?;
        let response_characteristic = self
            .platform
            .discover_characteristic(service, &self.definition.response_characteristic)
            .await
            .map_err(|e| step_failed("discover response characteristic", address, e))?;

        let sink = self.notification_sink.lock().clone();
        let bound_address = address.to_string();
        let on_notify: NotifyCallback = Box::new(move |_from, value| {
            if let Some(sink) = &sink {
                sink(bound_address.clone(), value);
            }
        });
        self.platform
            .subscribe_notifications(response_characteristic, on_notify)
            .await
            .map_err(|e| step_failed("subscribe to notifications", address, e))?;

        let session = Session {
            remote_address: address.to_string(),
            client,
            service,
            request_characteristic,
            response_characteristic,
        };
        self.sessions
            .insert(session.clone())
            .map_err(|e| BleError::Failed(e.to_string()))?;
        Ok(session)
    }

    async fn flush_pending(&self, session: &Session) {
        for (payload, error) in self.pending.flush_to(session, &self.writer).await {
            self.listener
                .send_error(&session.remote_address, &payload.data, &error);
        }
    }

    async fn disconnect_quietly(&self, address: &str) {
        if let Err(e) = self.platform.disconnect(address).await {
            debug!(address, "Disconnect after failed setup: {}", e);
        }
    }
}

fn step_failed(step: &str, address: &str, err: PlatformError) -> BleError {
    warn!(address, "Failed to {}: {}", step, err);
    BleError::Failed(format!("{} on {} failed: {}", step, address, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PeerProfile, SimulatedPlatform, WriteMode};
    use crate::transport::abstraction::MockLeEventListener;
    use std::time::Duration;

    const PEER: &str = "AA:00:00:00:00:01";

    struct Fixture {
        platform: Arc<SimulatedPlatform>,
        sessions: Arc<SessionRegistry>,
        pending: Arc<PendingSendQueue>,
        listener: ListenerSlot,
        orchestrator: ConnectionOrchestrator,
    }

    fn fixture() -> Fixture {
        let platform = Arc::new(SimulatedPlatform::new());
        let sessions = Arc::new(SessionRegistry::new(platform.clone()));
        let pending = Arc::new(PendingSendQueue::new(8));
        let writer = Arc::new(WriteSynchronizer::new(
            platform.clone(),
            Duration::from_secs(1),
        ));
        let listener = ListenerSlot::new();
        let orchestrator = ConnectionOrchestrator::new(
            platform.clone(),
            sessions.clone(),
            pending.clone(),
            writer,
            listener.clone(),
            GattServiceDefinition::default(),
            false,
        );
        Fixture {
            platform,
            sessions,
            pending,
            listener,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_discover_registers_session() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::Complete);

        let session = f
            .orchestrator
            .discover_services("aa:00:00:00:00:01")
            .await
            .expect("discover")
            .expect("session");

        assert_eq!(session.remote_address, PEER);
        assert_eq!(f.sessions.count(), 1);
        assert!(f.platform.is_subscribed(session.response_characteristic));
        assert!(!f.orchestrator.is_discovering(PEER));
    }

    #[tokio::test]
    async fn test_missing_characteristic_releases_and_disconnects() {
        let f = fixture();
        f.platform
            .add_peer(PEER, PeerProfile::MissingResponseCharacteristic);

        let result = f.orchestrator.discover_services(PEER).await;

        assert!(matches!(result, Err(BleError::Failed(_))));
        assert!(f.sessions.is_empty());
        assert_eq!(f.platform.destroyed_clients().len(), 1);
        assert_eq!(f.platform.disconnect_calls(), vec![PEER.to_string()]);
    }

    #[tokio::test]
    async fn test_missing_service_fails() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::MissingService);

        assert!(matches!(
            f.orchestrator.discover_services(PEER).await,
            Err(BleError::Failed(_))
        ));
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_discovery_flushes_pending_queue() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::Complete);
        f.pending.push(b"p1").unwrap();
        f.pending.push(b"p2").unwrap();

        f.orchestrator.discover_services(PEER).await.unwrap();

        let values: Vec<Vec<u8>> = f.platform.writes().into_iter().map(|w| w.value).collect();
        assert_eq!(values, vec![b"p1".to_vec(), b"p2".to_vec()]);
        assert_eq!(f.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_failures_reach_listener() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::Complete);
        f.platform.set_write_mode(WriteMode::Reject);
        f.pending.push(b"lost").unwrap();

        let mut mock = MockLeEventListener::new();
        mock.expect_on_send_error()
            .withf(|addr, data, err| {
                addr == PEER && data == b"lost" && matches!(err, BleError::Failed(_))
            })
            .times(1)
            .return_const(());
        f.listener.set_listener(Arc::new(mock));

        f.orchestrator.discover_services(PEER).await.unwrap();
        assert_eq!(f.sessions.count(), 1);
    }

    #[tokio::test]
    async fn test_connect_requests_link_when_not_connected() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::Complete);

        f.orchestrator.connect(PEER).await.expect("connect");

        assert_eq!(f.platform.connect_calls(), vec![PEER.to_string()]);
        // Discovery waits for the connection-state callback
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_connect_discovers_directly_when_profile_connected() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::Complete);
        f.platform.set_profile_connected(PEER, true);

        f.orchestrator.connect(PEER).await.expect("connect");

        assert!(f.platform.connect_calls().is_empty());
        assert_eq!(f.sessions.count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let f = fixture();

        let result = f.orchestrator.connect("AA:00:00:00:00:99").await;
        assert!(matches!(result, Err(BleError::Failed(_))));
    }

    #[tokio::test]
    async fn test_ready_is_broadcast_after_discovery() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::Complete);
        let mut ready = f.orchestrator.subscribe_ready();

        f.orchestrator.discover_services(PEER).await.unwrap();

        assert_eq!(ready.recv().await.expect("ready"), PEER);
    }

    #[tokio::test]
    async fn test_notifications_reach_sink() {
        let f = fixture();
        f.platform.add_peer(PEER, PeerProfile::Complete);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_received = received.clone();
        f.orchestrator
            .set_notification_sink(Arc::new(move |address: String, value: Vec<u8>| {
                sink_received.lock().push((address, value));
            }));

        f.orchestrator.discover_services(PEER).await.unwrap();
        assert!(f.platform.notify_from_peer(PEER, b"resp"));

        assert_eq!(
            received.lock().clone(),
            vec![(PEER.to_string(), b"resp".to_vec())]
        );
    }
}
