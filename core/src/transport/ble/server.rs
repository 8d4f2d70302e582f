// Server role runtime
//
// Hosts the transport service, tracks the GATT clients connected to it and
// pushes outbound payloads as notifications on the response characteristic.
// Advertising is stopped while a client is connected and restarted when it
// leaves.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::gatt::{normalize_address, GattServiceDefinition};
use super::platform::GattServerPlatform;
use super::registry::ClientRegistry;
use crate::config::BleAdapterConfig;
use crate::transport::abstraction::{
    BleError, ConnectionStateHandler, LeEventListener, ListenerSlot,
};

#[derive(Debug)]
enum ServerEvent {
    ClientConnection { address: String, connected: bool },
    WriteRequest { address: String, value: Vec<u8> },
    Shutdown,
}

struct ServerInner {
    definition: GattServiceDefinition,
    platform: Arc<dyn GattServerPlatform>,
    clients: ClientRegistry,
    listener: ListenerSlot,
    running: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// GATT server role: advertise, accept clients, notify
#[derive(Clone)]
pub struct LeServer {
    inner: Arc<ServerInner>,
}

impl LeServer {
    pub fn new(config: &BleAdapterConfig, platform: Arc<dyn GattServerPlatform>) -> Self {
        Self::with_listener(config, platform, ListenerSlot::new())
    }

    pub fn with_listener(
        config: &BleAdapterConfig,
        platform: Arc<dyn GattServerPlatform>,
        listener: ListenerSlot,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                definition: config.service_definition(),
                clients: ClientRegistry::new(platform.clone()),
                platform,
                listener,
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

    /// Register the GATT service and start advertising it
    pub async fn start(&self) -> Result<(), BleError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();

        let connection_tx = tx.clone();
        self.inner
            .platform
            .set_on_client_connection_state_changed(Box::new(
                move |address: String, connected: bool| {
                    let _ = connection_tx.send(ServerEvent::ClientConnection { address, connected });
                },
            ));
        let write_tx = tx.clone();
        self.inner
            .platform
            .set_on_write_requested(Box::new(move |address: String, value: Vec<u8>| {
                let _ = write_tx.send(ServerEvent::WriteRequest { address, value });
            }));

        if let Err(e) = self.inner.platform.start_server(&self.inner.definition).await {
            self.inner.running.store(false, Ordering::SeqCst);
            warn!("Failed to start GATT server: {}", e);
            return Err(e.into());
        }
        if let Err(e) = self.inner.platform.start_advertising().await {
            self.inner.running.store(false, Ordering::SeqCst);
            warn!("Failed to start advertising: {}", e);
            if let Err(stop) = self.inner.platform.stop_server().await {
                debug!("Failed to stop GATT server: {}", stop);
            }
            return Err(e.into());
        }

        *self.inner.events.lock() = Some(tx);
        let handle = tokio::spawn(run_event_loop(self.inner.clone(), rx));
        *self.inner.event_loop.lock() = Some(handle);

        info!(service = %self.inner.definition.service, "LE server started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.clients.disconnect_all().await;
        if let Err(e) = self.inner.platform.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
        }
        if let Err(e) = self.inner.platform.stop_server().await {
            warn!("Failed to stop GATT server: {}", e);
        }

        if let Some(tx) = self.inner.events.lock().take() {
            let _ = tx.send(ServerEvent::Shutdown);
        }
        let handle = self.inner.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("LE server event loop ended abnormally: {}", e);
            }
        }
        info!("LE server stopped");
    }

    /// Forget every connected client after the adapter went away
    pub async fn reset(&self) {
        self.inner.clients.disconnect_all().await;
        debug!("LE server state reset");
    }

    /// Notify one connected client
    pub async fn send_unicast(&self, address: &str, data: &[u8]) -> Result<(), BleError> {
        self.ensure_running()?;
        if data.is_empty() {
            return Err(BleError::InvalidParam("payload is empty".to_string()));
        }
        let address = normalize_address(address)?;
        if !self.inner.clients.contains(&address) {
            return Err(BleError::Failed(format!(
                "{} is not a connected GATT client",
                address
            )));
        }
        self.inner.notify(&address, data).await
    }

    /// Notify every connected client; per-client failures go to `on_send_error`
    pub async fn send_multicast(&self, data: &[u8]) -> Result<(), BleError> {
        self.ensure_running()?;
        if data.is_empty() {
            return Err(BleError::InvalidParam("payload is empty".to_string()));
        }

        let clients = self.inner.clients.addresses();
        debug!(clients = clients.len(), len = data.len(), "Server multicast");
        for address in clients {
            if let Err(e) = self.inner.notify(&address, data).await {
                self.inner.listener.send_error(&address, data, &e);
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn has_client(&self, address: &str) -> bool {
        normalize_address(address)
            .map(|address| self.inner.clients.contains(&address))
            .unwrap_or(false)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.count()
    }

    pub fn client_addresses(&self) -> Vec<String> {
        self.inner.clients.addresses()
    }

    fn ensure_running(&self) -> Result<(), BleError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BleError::Failed("LE server is not started".to_string()))
        }
    }
}

impl ServerInner {
    async fn notify(&self, address: &str, data: &[u8]) -> Result<(), BleError> {
        self.platform
            .notify(address, &self.definition.response_characteristic, data)
            .await
            .map_err(|e| {
                warn!(address, "Notification failed: {}", e);
                BleError::from(e)
            })?;
        debug!(address, len = data.len(), "Notification sent");
        Ok(())
    }

    async fn client_connected(&self, address: &str) {
        if let Err(e) = self.clients.insert(address) {
            debug!(address, "{}", e);
            return;
        }
        info!(address, clients = self.clients.count(), "GATT client connected");
        if let Err(e) = self.platform.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
        }
        self.listener.connection_state_changed(address, true);
    }

    async fn client_disconnected(&self, address: &str) {
        if !self.clients.remove(address) {
            debug!(address, "Unknown GATT client disconnected");
            return;
        }
        info!(address, clients = self.clients.count(), "GATT client disconnected");
        if let Err(e) = self.platform.start_advertising().await {
            warn!("Failed to restart advertising: {}", e);
        }
        self.listener.connection_state_changed(address, false);
    }
}

async fn run_event_loop(inner: Arc<ServerInner>, mut rx: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = rx.recv().await {
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        match event {
            ServerEvent::ClientConnection { address, connected } => {
                let address = match normalize_address(&address) {
                    Ok(address) => address,
                    Err(_) => continue,
                };
                if connected {
                    inner.client_connected(&address).await;
                } else {
                    inner.client_disconnected(&address).await;
                }
            }
            ServerEvent::WriteRequest { address, value } => {
                let address = match normalize_address(&address) {
                    Ok(address) => address,
                    Err(_) => continue,
                };
                debug!(address = %address, len = value.len(), "Write request received");
                inner.listener.data_received(&address, &value);
            }
            ServerEvent::Shutdown => break,
        }
    }
    debug!("LE server event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedPlatform;
    use crate::transport::ble::gatt::GATT_RESPONSE_CHARACTERISTIC_UUID;

    fn server() -> (Arc<SimulatedPlatform>, LeServer) {
        let platform = Arc::new(SimulatedPlatform::new());
        let server = LeServer::new(&BleAdapterConfig::default(), platform.clone());
        (platform, server)
    }

    #[tokio::test]
    async fn test_start_registers_service_and_advertises() {
        let (platform, server) = server();
        server.start().await.expect("start");

        assert!(platform.is_server_running());
        assert!(platform.is_advertising());
        assert_eq!(
            platform.server_definition(),
            Some(GattServiceDefinition::default())
        );

        server.stop().await;
        assert!(!platform.is_server_running());
        assert!(!platform.is_advertising());
    }

    #[tokio::test]
    async fn test_unicast_to_unknown_client_fails() {
        let (platform, server) = server();
        server.start().await.unwrap();

        assert!(matches!(
            server.send_unicast("BB:00:00:00:00:01", b"abc").await,
            Err(BleError::Failed(_))
        ));
        assert!(platform.notifications().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_multicast_with_no_clients_succeeds() {
        let (platform, server) = server();
        server.start().await.unwrap();

        server.send_multicast(b"abc").await.expect("multicast");
        assert!(platform.notifications().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_sends_require_start() {
        let (_, server) = server();
        assert!(server.send_multicast(b"abc").await.is_err());
        assert!(server
            .send_unicast("BB:00:00:00:00:01", b"abc")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_notify_uses_response_characteristic() {
        let (platform, server) = server();
        server.start().await.unwrap();
        platform.emit_client_connection("bb:00:00:00:00:01", true);

        for _ in 0..100 {
            if server.has_client("BB:00:00:00:00:01") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        server
            .send_unicast("BB:00:00:00:00:01", b"resp")
            .await
            .expect("unicast");

        let sent = platform.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].address, "BB:00:00:00:00:01");
        assert_eq!(sent[0].characteristic, GATT_RESPONSE_CHARACTERISTIC_UUID);
        server.stop().await;
    }
}
