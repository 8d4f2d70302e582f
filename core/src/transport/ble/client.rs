// Client role runtime
//
// Owns the client-role state (sessions, discovered devices, pending
// multicast queue, scan controller, write synchronizer) and the event loop
// that drains platform callbacks. Platform callbacks only push a
// `ClientEvent`; connect and discover work runs on a worker pool bounded by
// `max_workers`.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::ConnectionOrchestrator;
use super::device_cache::DiscoveredDeviceCache;
use super::gatt::{normalize_address, ScanResult, Session};
use super::pending::PendingSendQueue;
use super::platform::GattClientPlatform;
use super::registry::SessionRegistry;
use super::scanner::{ScanController, ScanDecision, ScanState};
use super::write_sync::WriteSynchronizer;
use crate::config::BleAdapterConfig;
use crate::transport::abstraction::{
    BleError, ConnectionStateHandler, LeEventListener, ListenerSlot,
};

/// Work delivered from platform callbacks to the event loop
#[derive(Debug)]
enum ClientEvent {
    Advertisement(ScanResult),
    ConnectionState { address: String, connected: bool },
    Notification { address: String, value: Vec<u8> },
    Shutdown,
}

struct ClientInner {
    config: BleAdapterConfig,
    platform: Arc<dyn GattClientPlatform>,
    sessions: Arc<SessionRegistry>,
    cache: Arc<DiscoveredDeviceCache>,
    pending: Arc<PendingSendQueue>,
    writer: Arc<WriteSynchronizer>,
    scanner: Arc<ScanController>,
    orchestrator: Arc<ConnectionOrchestrator>,
    listener: ListenerSlot,
    workers: Arc<Semaphore>,
    running: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// GATT client role: scan, connect, discover, write
#[derive(Clone)]
pub struct LeClient {
    inner: Arc<ClientInner>,
}

impl LeClient {
    pub fn new(config: &BleAdapterConfig, platform: Arc<dyn GattClientPlatform>) -> Self {
        Self::with_listener(config, platform, ListenerSlot::new())
    }

    /// Build a client that reports through an existing listener slot
    pub fn with_listener(
        config: &BleAdapterConfig,
        platform: Arc<dyn GattClientPlatform>,
        listener: ListenerSlot,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(platform.clone()));
        let cache = Arc::new(DiscoveredDeviceCache::new());
        let pending = Arc::new(PendingSendQueue::new(config.max_pending_payloads));
        let writer = Arc::new(WriteSynchronizer::new(
            platform.clone(),
            config.write_timeout(),
        ));
        let scanner = Arc::new(ScanController::new(
            platform.clone(),
            cache.clone(),
            pending.clone(),
            config.service_uuid,
            config.scan_timeout(),
        ));
        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            platform.clone(),
            sessions.clone(),
            pending.clone(),
            writer.clone(),
            listener.clone(),
            config.service_definition(),
            config.auto_connect,
        ));

        Self {
            inner: Arc::new(ClientInner {
                config: config.clone(),
                platform,
                sessions,
                cache,
                pending,
                writer,
                scanner,
                orchestrator,
                listener,
                workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
                running: AtomicBool::new(false),
                events: Mutex::new(None),
                event_loop: Mutex::new(None),
            }),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn LeEventListener>) {
        self.inner.listener.set_listener(listener);
    }

    pub fn set_connection_state_changed_handler(&self, handler: ConnectionStateHandler) {
        self.inner.listener.set_connection_handler(handler);
    }

    /// Register platform callbacks and spawn the event loop. Idempotent.
    pub async fn start(&self) -> Result<(), BleError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let connection_tx = tx.clone();
        self.inner
            .platform
            .set_on_connection_state_changed(Box::new(move |address: String, connected: bool| {
                let _ = connection_tx.send(ClientEvent::ConnectionState { address, connected });
            }));

        let scan_tx = tx.clone();
        self.inner.scanner.start(Arc::new(move |result: ScanResult| {
            let _ = scan_tx.send(ClientEvent::Advertisement(result));
        }));

        let notify_tx = tx.clone();
        self.inner
            .orchestrator
            .set_notification_sink(Arc::new(move |address: String, value: Vec<u8>| {
                let _ = notify_tx.send(ClientEvent::Notification { address, value });
            }));

        self.inner.writer.reopen();
        *self.inner.events.lock() = Some(tx);
        let handle = tokio::spawn(run_event_loop(self.inner.clone(), rx));
        *self.inner.event_loop.lock() = Some(handle);

        info!(
            workers = self.inner.config.max_workers,
            "LE client started"
        );
        Ok(())
    }

    /// Stop scanning, fail outstanding writes, drop every session and stop
    /// the event loop. Callbacks that arrive afterwards are ignored.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.scanner.shutdown().await;
        self.inner.writer.shutdown();
        self.inner.sessions.clear().await;
        self.inner.pending.clear();
        self.inner.cache.clear();

        if let Some(tx) = self.inner.events.lock().take() {
            let _ = tx.send(ClientEvent::Shutdown);
        }
        let handle = self.inner.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("LE client event loop ended abnormally: {}", e);
            }
        }
        info!("LE client stopped");
    }

    /// Drop all link state after the adapter went away, staying started
    pub async fn reset(&self) {
        self.inner.scanner.reset().await;
        self.inner.writer.shutdown();
        self.inner.writer.reopen();
        self.inner.sessions.clear().await;
        let dropped = self.inner.pending.clear();
        if dropped > 0 {
            warn!(dropped, "Discarding pending multicast payloads on reset");
        }
        debug!("LE client state reset");
    }

    /// Write `data` to one peer, connecting on demand if allowed.
    ///
    /// Blocks until the write completes, bounded by `write_timeout_ms` (plus
    /// `connect_timeout_ms` when a session has to be brought up first).
    pub async fn send_unicast(&self, address: &str, data: &[u8]) -> Result<(), BleError> {
        self.ensure_running()?;
        if data.is_empty() {
            return Err(BleError::InvalidParam("payload is empty".to_string()));
        }
        let address = normalize_address(address)?;

        let session = match self.inner.sessions.find(&address) {
            Some(session) => session,
            None if self.inner.config.connect_on_unicast => {
                self.inner.connect_on_demand(&address).await?
            }
            None => {
                return Err(BleError::Failed(format!("no session for {}", address)));
            }
        };

        self.inner.writer.write_and_wait(&session, data).await
    }

    /// Write `data` to every connected peer and queue it for peers found later.
    ///
    /// Per-peer failures go to `on_send_error`. Succeeds with zero peers. A
    /// full queue fails the call only when there was no peer to write to.
    pub async fn send_multicast(&self, data: &[u8]) -> Result<(), BleError> {
        self.ensure_running()?;
        if data.is_empty() {
            return Err(BleError::InvalidParam("payload is empty".to_string()));
        }

        let count = self.inner.sessions.count();
        let targets: Vec<Session> = (0..count)
            .filter_map(|index| self.inner.sessions.find_by_position(index))
            .collect();
        debug!(peers = targets.len(), len = data.len(), "Multicast");

        for session in &targets {
            if let Err(e) = self.inner.writer.write_and_wait(session, data).await {
                self.inner
                    .listener
                    .send_error(&session.remote_address, data, &e);
            }
        }

        // Before queuing, so a concurrent expiry keeps this payload
        self.inner.scanner.begin_multicast_cycle();
        let queued = self.inner.pending.push(data);
        if let Err(e) = &queued {
            warn!(peers = targets.len(), "Multicast payload not queued: {}", e);
        }
        self.inner.scanner.start_scanning().await?;

        match queued {
            Err(e) if targets.is_empty() => Err(e),
            _ => Ok(()),
        }
    }

    /// Begin connecting to `address` without sending anything
    pub async fn connect(&self, address: &str) -> Result<(), BleError> {
        self.ensure_running()?;
        self.inner.orchestrator.connect(address).await
    }

    /// Tear down the session to `address`, if any
    pub async fn disconnect(&self, address: &str) -> Result<(), BleError> {
        let address = normalize_address(address)?;
        self.inner.platform.disconnect(&address).await?;
        self.inner.handle_disconnected(&address).await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn scan_state(&self) -> ScanState {
        self.inner.scanner.state()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.count()
    }

    pub fn session_addresses(&self) -> Vec<String> {
        self.inner.sessions.addresses()
    }

    pub fn has_session(&self, address: &str) -> bool {
        normalize_address(address)
            .map(|address| self.inner.sessions.find(&address).is_some())
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn discovered_count(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn config(&self) -> &BleAdapterConfig {
        &self.inner.config
    }

    fn ensure_running(&self) -> Result<(), BleError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BleError::Failed("LE client is not started".to_string()))
        }
    }
}

impl ClientInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `task` on the worker pool
    fn spawn_worker<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            task.await;
        });
    }

    async fn connect_task(self: Arc<Self>, address: String) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.orchestrator.connect(&address).await {
            warn!(address = %address, "Connect attempt failed: {}", e);
        }
        self.resume_scanning().await;
    }

    async fn discover_task(self: Arc<Self>, address: String) {
        if !self.is_running() {
            return;
        }
        match self.orchestrator.discover_services(&address).await {
            Ok(Some(session)) => {
                if !self.is_running() {
                    // Stopped while discovering
                    self.sessions.clear().await;
                    return;
                }
                self.listener
                    .connection_state_changed(&session.remote_address, true);
            }
            Ok(None) => {}
            Err(e) => warn!(address = %address, "Service discovery failed: {}", e),
        }
        self.resume_scanning().await;
    }

    async fn resume_scanning(&self) {
        if let Err(e) = self.scanner.resume_if_cycle_active().await {
            warn!("Failed to resume scanning: {}", e);
        }
    }

    async fn handle_disconnected(&self, address: &str) {
        self.writer.revoke_address(address);
        if let Some(session) = self.sessions.remove(address) {
            if let Err(e) = self.platform.destroy_client(session.client).await {
                warn!(address, "Failed to destroy GATT client: {}", e);
            }
            self.cache.remove(address);
            info!(address, sessions = self.sessions.count(), "GATT session closed");
        } else {
            debug!(address, "Disconnected without a session");
        }
        self.listener.connection_state_changed(address, false);

        if self.scanner.is_cycle_armed() && !self.pending.is_empty() {
            if let Err(e) = self.scanner.start_scanning().await {
                warn!("Failed to restart scanning after disconnect: {}", e);
            }
        }
    }

    async fn connect_on_demand(&self, address: &str) -> Result<Session, BleError> {
        // Subscribe before connecting so a fast discovery is not missed
        let mut ready = self.orchestrator.subscribe_ready();
        self.orchestrator.connect(address).await?;

        let wait = async {
            loop {
                if let Some(session) = self.sessions.find(address) {
                    return Ok(session);
                }
                match ready.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BleError::Failed("LE client stopped".to_string()))
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.connect_timeout(), wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    address,
                    timeout_ms = self.config.connect_timeout_ms,
                    "No session before connect timeout"
                );
                Err(BleError::Failed(format!(
                    "no session to {} within {} ms",
                    address, self.config.connect_timeout_ms
                )))
            }
        }
    }
}

async fn run_event_loop(inner: Arc<ClientInner>, mut rx: mpsc::UnboundedReceiver<ClientEvent>) {
    debug!("LE client event loop running");
    while let Some(event) = rx.recv().await {
        if !inner.is_running() {
            break;
        }
        match event {
            ClientEvent::Advertisement(result) => {
                if let ScanDecision::Connect(address) = inner.scanner.on_scan_result(&result).await
                {
                    let task = inner.clone().connect_task(address);
                    inner.spawn_worker(task);
                }
            }
            ClientEvent::ConnectionState { address, connected } => {
                let address = match normalize_address(&address) {
                    Ok(address) => address,
                    Err(_) => continue,
                };
                if connected {
                    debug!(address = %address, "GATT link up");
                    let task = inner.clone().discover_task(address);
                    inner.spawn_worker(task);
                } else {
                    inner.handle_disconnected(&address).await;
                }
                inner.scanner.signal_link_activity();
                if let Err(e) = inner.scanner.start_scanning().await {
                    warn!("Failed to start scanning after link change: {}", e);
                }
            }
            ClientEvent::Notification { address, value } => {
                debug!(address = %address, len = value.len(), "Notification received");
                inner.listener.data_received(&address, &value);
            }
            ClientEvent::Shutdown => break,
        }
    }
    debug!("LE client event loop stopped");
}
