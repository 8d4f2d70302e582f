// Role facade
//
// `LeTransport` is what the transport-selection layer above talks to. It
// runs the client role, the server role or both over one platform, routes
// unicast to whichever role owns the peer, fans multicast out through every
// role, and watches the local adapter: when it is switched off, all link
// state is dropped before the change is reported upward.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::LeClient;
use super::platform::{AdapterControl, GattClientPlatform, GattServerPlatform};
use super::server::LeServer;
use crate::config::BleAdapterConfig;
use crate::transport::abstraction::{
    BleError, ConnectionStateHandler, LeEventListener, LinkRole, ListenerSlot,
};

/// Platform bindings handed to `LeTransport`
pub struct LePlatforms {
    pub client: Option<Arc<dyn GattClientPlatform>>,
    pub server: Option<Arc<dyn GattServerPlatform>>,
    pub adapter: Arc<dyn AdapterControl>,
}

impl LePlatforms {
    /// One binding that implements both roles and adapter control
    pub fn from_shared<P>(platform: Arc<P>) -> Self
    where
        P: GattClientPlatform + GattServerPlatform + AdapterControl + 'static,
    {
        Self {
            client: Some(platform.clone()),
            server: Some(platform.clone()),
            adapter: platform,
        }
    }

    /// Central-only binding
    pub fn client_only<P>(platform: Arc<P>) -> Self
    where
        P: GattClientPlatform + AdapterControl + 'static,
    {
        Self {
            client: Some(platform.clone()),
            server: None,
            adapter: platform,
        }
    }
}

enum AdapterEvent {
    StateChanged(bool),
    Shutdown,
}

pub struct LeTransport {
    config: BleAdapterConfig,
    client: Option<LeClient>,
    server: Option<LeServer>,
    adapter: Arc<dyn AdapterControl>,
    listener: ListenerSlot,
    running: AtomicBool,
    monitor_tx: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl LeTransport {
    /// Build the roles named by `config.role`. Fails with `NotSupported`
    /// if a required role has no platform binding.
    pub fn new(config: BleAdapterConfig, platforms: LePlatforms) -> Result<Self, BleError> {
        config
            .validate()
            .map_err(|e| BleError::InvalidParam(e.to_string()))?;

        let listener = ListenerSlot::new();

        let client = if config.role.runs_client() {
            let platform = platforms.client.ok_or_else(|| {
                BleError::NotSupported("no GATT client binding for this platform".to_string())
            })?;
            Some(LeClient::with_listener(&config, platform, listener.clone()))
        } else {
            None
        };

        let server = if config.role.runs_server() {
            let platform = platforms.server.ok_or_else(|| {
                BleError::NotSupported("no GATT server binding for this platform".to_string())
            })?;
            Some(LeServer::with_listener(&config, platform, listener.clone()))
        } else {
            None
        };

        Ok(Self {
            config,
            client,
            server,
            adapter: platforms.adapter,
            listener,
            running: AtomicBool::new(false),
            monitor_tx: Mutex::new(None),
            monitor: Mutex::new(None),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn LeEventListener>) {
        self.listener.set_listener(listener);
    }

    pub fn set_connection_state_changed_handler(&self, handler: ConnectionStateHandler) {
        self.listener.set_connection_handler(handler);
    }

    /// Verify the adapter is on, then start every configured role
    pub async fn start(&self) -> Result<(), BleError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.adapter.is_enabled().await? {
            warn!("Bluetooth adapter is disabled");
            return Err(BleError::Failed("Bluetooth adapter is disabled".to_string()));
        }

        if let Some(client) = &self.client {
            client.start().await?;
        }
        if let Some(server) = &self.server {
            if let Err(e) = server.start().await {
                if let Some(client) = &self.client {
                    client.stop().await;
                }
                return Err(e);
            }
        }

        self.spawn_monitor();
        self.running.store(true, Ordering::SeqCst);
        info!(role = %self.config.role, "LE transport started");
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.monitor_tx.lock().take() {
            let _ = tx.send(AdapterEvent::Shutdown);
        }
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(e) = monitor.await {
                warn!("Adapter monitor ended abnormally: {}", e);
            }
        }

        if let Some(client) = &self.client {
            client.stop().await;
        }
        if let Some(server) = &self.server {
            server.stop().await;
        }
        info!("LE transport stopped");
    }

    /// Which role a unicast to `address` goes through.
    ///
    /// A peer connected to our GATT server is notified; anything else goes
    /// through the client role.
    pub fn route_for(&self, address: &str) -> Option<LinkRole> {
        match (&self.server, &self.client) {
            (Some(server), _) if server.has_client(address) => Some(LinkRole::Server),
            (_, Some(_)) => Some(LinkRole::Client),
            _ => None,
        }
    }

    pub async fn send_unicast(&self, address: &str, data: &[u8]) -> Result<(), BleError> {
        match (self.route_for(address), &self.client, &self.server) {
            (Some(LinkRole::Server), _, Some(server)) => server.send_unicast(address, data).await,
            (Some(LinkRole::Client), Some(client), _) => client.send_unicast(address, data).await,
            _ => Err(BleError::NotSupported(format!(
                "{} is not a connected client and the client role is not running",
                address
            ))),
        }
    }

    /// Fan out through every role. Fails only if every role fails.
    pub async fn send_multicast(&self, data: &[u8]) -> Result<(), BleError> {
        let mut first_error = None;
        let mut delivered = false;

        if let Some(client) = &self.client {
            match client.send_multicast(data).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    debug!("Client multicast failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(server) = &self.server {
            match server.send_multicast(data).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    debug!("Server multicast failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match (delivered, first_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(BleError::NotSupported("no LE role configured".to_string())),
        }
    }

    pub async fn local_address(&self) -> Result<String, BleError> {
        Ok(self.adapter.local_address().await?)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> Option<&LeClient> {
        self.client.as_ref()
    }

    pub fn server(&self) -> Option<&LeServer> {
        self.server.as_ref()
    }

    pub fn config(&self) -> &BleAdapterConfig {
        &self.config
    }

    fn spawn_monitor(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state_tx = tx.clone();
        self.adapter
            .set_on_adapter_state_changed(Box::new(move |enabled: bool| {
                let _ = state_tx.send(AdapterEvent::StateChanged(enabled));
            }));

        let client = self.client.clone();
        let server = self.server.clone();
        let listener = self.listener.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    AdapterEvent::StateChanged(false) => {
                        warn!("Bluetooth adapter disabled, dropping LE link state");
                        if let Some(client) = &client {
                            client.reset().await;
                        }
                        if let Some(server) = &server {
                            server.reset().await;
                        }
                        listener.adapter_state_changed(false);
                    }
                    AdapterEvent::StateChanged(true) => {
                        info!("Bluetooth adapter enabled");
                        listener.adapter_state_changed(true);
                    }
                    AdapterEvent::Shutdown => break,
                }
            }
            debug!("Adapter monitor stopped");
        });

        *self.monitor_tx.lock() = Some(tx);
        *self.monitor.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeRole;
    use crate::testing::SimulatedPlatform;
    use crate::transport::abstraction::MockLeEventListener;

    fn transport(role: LeRole) -> (Arc<SimulatedPlatform>, LeTransport) {
        let platform = Arc::new(SimulatedPlatform::new());
        let config = BleAdapterConfig {
            role,
            ..Default::default()
        };
        let transport =
            LeTransport::new(config, LePlatforms::from_shared(platform.clone())).expect("new");
        (platform, transport)
    }

    #[tokio::test]
    async fn test_start_fails_when_adapter_disabled() {
        let (platform, transport) = transport(LeRole::Dual);
        platform.set_enabled(false);

        assert!(matches!(transport.start().await, Err(BleError::Failed(_))));
        assert!(!transport.is_running());
        assert!(!platform.is_server_running());
    }

    #[tokio::test]
    async fn test_roles_follow_config() {
        let (_, client_only) = transport(LeRole::Client);
        assert!(client_only.client().is_some());
        assert!(client_only.server().is_none());

        let (_, dual) = transport(LeRole::Dual);
        assert!(dual.client().is_some() && dual.server().is_some());
    }

    #[tokio::test]
    async fn test_missing_binding_is_not_supported() {
        let platform = Arc::new(SimulatedPlatform::new());
        let config = BleAdapterConfig {
            role: LeRole::Server,
            ..Default::default()
        };
        let result = LeTransport::new(config, LePlatforms::client_only(platform));
        assert!(matches!(result, Err(BleError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_unicast_routing() {
        let (platform, transport) = transport(LeRole::Dual);
        transport.start().await.unwrap();
        assert_eq!(transport.route_for("BB:00:00:00:00:01"), Some(LinkRole::Client));

        platform.emit_client_connection("BB:00:00:00:00:01", true);
        for _ in 0..100 {
            if transport.route_for("BB:00:00:00:00:01") == Some(LinkRole::Server) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(transport.route_for("bb:00:00:00:00:01"), Some(LinkRole::Server));

        transport
            .send_unicast("BB:00:00:00:00:01", b"resp")
            .await
            .expect("unicast");
        assert_eq!(platform.notifications().len(), 1);
        assert!(platform.writes().is_empty());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_unicast_without_client_role_is_not_supported() {
        let (_, transport) = transport(LeRole::Server);
        transport.start().await.unwrap();

        assert!(matches!(
            transport.send_unicast("AA:00:00:00:00:01", b"abc").await,
            Err(BleError::NotSupported(_))
        ));
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_multicast_succeeds_if_any_role_does() {
        let config = BleAdapterConfig {
            role: LeRole::Dual,
            max_pending_payloads: 1,
            ..Default::default()
        };
        let platform = Arc::new(SimulatedPlatform::new());
        let transport =
            LeTransport::new(config, LePlatforms::from_shared(platform.clone())).unwrap();
        transport.start().await.unwrap();

        transport.send_multicast(b"one").await.expect("first");
        // No client peers and a full queue fails the client; the server role still succeeds
        transport.send_multicast(b"two").await.expect("second");
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_local_address_delegates() {
        let (platform, transport) = transport(LeRole::Client);
        platform.set_local_address("12:34:56:78:9A:BC");
        assert_eq!(
            transport.local_address().await.unwrap(),
            "12:34:56:78:9A:BC"
        );
    }

    #[tokio::test]
    async fn test_adapter_disable_is_forwarded() {
        let (platform, transport) = transport(LeRole::Client);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mock = MockLeEventListener::new();
        mock.expect_on_adapter_state_changed()
            .returning(move |enabled| {
                let _ = tx.send(enabled);
            });
        transport.set_listener(Arc::new(mock));
        transport.start().await.unwrap();
        transport.send_multicast(b"abc").await.unwrap();

        assert!(platform.emit_adapter_state(false));
        let enabled = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("forwarded")
            .expect("value");

        assert!(!enabled);
        let client = transport.client().unwrap();
        assert_eq!(client.pending_count(), 0);
        assert!(!platform.is_scanning());
        transport.stop().await;
    }
}
