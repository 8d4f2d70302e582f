// Integration test: client role end to end over the simulated stack
//
// Covers the multicast-driven discovery path: a multicast with no peers
// starts a scan, a matching advertisement is connected and discovered, and
// the queued payloads are replayed to the new session. Link changes drive
// the same bounded scan cycle.

use ocfble_core::testing::{ConnectMode, PeerProfile, SimulatedPlatform, WriteMode};
use ocfble_core::transport::ble::{ScanResult, ScanState, GATT_SERVICE_UUID};
use ocfble_core::{BleAdapterConfig, BleError, LeClient, LeEventListener};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PEER: &str = "AA:BB:CC:00:00:01";
const OTHER_PEER: &str = "AA:BB:CC:00:00:02";

#[derive(Default)]
struct RecordingListener {
    received: Mutex<Vec<(String, Vec<u8>)>>,
    send_errors: Mutex<Vec<(String, Vec<u8>, BleError)>>,
}

impl LeEventListener for RecordingListener {
    fn on_data_received(&self, address: &str, data: &[u8]) {
        self.received.lock().push((address.to_string(), data.to_vec()));
    }

    fn on_send_error(&self, address: &str, data: &[u8], error: &BleError) {
        self.send_errors
            .lock()
            .push((address.to_string(), data.to_vec(), error.clone()));
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();
}

async fn started_client(
    config: BleAdapterConfig,
) -> (Arc<SimulatedPlatform>, LeClient, Arc<RecordingListener>) {
    init_tracing();
    let platform = Arc::new(SimulatedPlatform::new());
    let client = LeClient::new(&config, platform.clone());
    let listener = Arc::new(RecordingListener::default());
    client.set_listener(listener.clone());
    client.start().await.expect("client start");
    (platform, client, listener)
}

fn matching(address: &str) -> ScanResult {
    ScanResult::new(address, vec![GATT_SERVICE_UUID])
}

#[tokio::test]
async fn test_multicast_reaches_peer_discovered_later() {
    let (platform, client, _) = started_client(BleAdapterConfig::default()).await;
    let connected = Arc::new(Mutex::new(Vec::new()));
    let seen = connected.clone();
    client.set_connection_state_changed_handler(Arc::new(move |addr: &str, up: bool| {
        seen.lock().push((addr.to_string(), up));
    }));

    // No peers yet: the payload is queued and a scan starts
    client.send_multicast(&[0x01, 0x02, 0x03]).await.expect("multicast");
    assert_eq!(client.scan_state(), ScanState::Scanning);
    assert_eq!(client.pending_count(), 1);

    platform.add_peer(PEER, PeerProfile::Complete);
    assert!(platform.advertise(matching(PEER)));

    wait_until("queued payload written", || {
        platform.writes_to(PEER) == vec![vec![0x01, 0x02, 0x03]]
    })
    .await;
    wait_until("connection handler", || !connected.lock().is_empty()).await;

    assert_eq!(client.session_count(), 1);
    assert!(client.has_session(PEER));
    assert_eq!(connected.lock()[0], (PEER.to_string(), true));
    // Scan cycle is still armed, so scanning resumed after the connect
    wait_until("scan resumed", || client.scan_state() == ScanState::Scanning).await;

    client.stop().await;
}

#[tokio::test]
async fn test_every_queued_payload_is_replayed_in_order() {
    let (platform, client, _) = started_client(BleAdapterConfig::default()).await;

    client.send_multicast(b"p1").await.unwrap();
    client.send_multicast(b"p2").await.unwrap();
    client.send_multicast(b"p3").await.unwrap();

    platform.add_peer(PEER, PeerProfile::Complete);
    platform.advertise(matching(PEER));

    wait_until("replay", || platform.writes_to(PEER).len() == 3).await;
    assert_eq!(
        platform.writes_to(PEER),
        vec![b"p1".to_vec(), b"p2".to_vec(), b"p3".to_vec()]
    );
    // Replay keeps the queue for peers found later
    assert_eq!(client.pending_count(), 3);

    platform.add_peer(OTHER_PEER, PeerProfile::Complete);
    platform.advertise(matching(OTHER_PEER));
    wait_until("second replay", || platform.writes_to(OTHER_PEER).len() == 3).await;

    client.stop().await;
}

#[tokio::test]
async fn test_scan_results_are_handled_once_per_address() {
    let (platform, client, _) = started_client(BleAdapterConfig::default()).await;
    client.send_multicast(b"hello").await.unwrap();

    platform.advertise(ScanResult::new("11:22:33:44:55:66", vec![]));
    platform.advertise(ScanResult::new("11:22:33:44:55:66", vec![]));
    wait_until("non-match recorded", || client.discovered_count() == 1).await;

    platform.set_connect_mode(ConnectMode::Manual);
    platform.add_peer(PEER, PeerProfile::Complete);
    platform.advertise(matching(PEER));
    wait_until("connect requested", || platform.connect_calls().len() == 1).await;

    // Scan resumes after the connect request; the same device again is a no-op
    wait_until("scan resumed", || platform.is_scanning()).await;
    platform.advertise(matching(PEER));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(platform.connect_calls(), vec![PEER.to_string()]);
    assert_eq!(client.discovered_count(), 2);
    client.stop().await;
}

#[tokio::test]
async fn test_scan_cycle_timeout_drops_cache_and_queue() {
    let config = BleAdapterConfig {
        scan_timeout_ms: 50,
        ..Default::default()
    };
    let (platform, client, _) = started_client(config).await;

    client.send_multicast(b"nobody").await.unwrap();
    platform.advertise(ScanResult::new("11:22:33:44:55:66", vec![]));
    wait_until("device recorded", || client.discovered_count() == 1).await;

    wait_until("cycle expired", || client.scan_state() == ScanState::Idle).await;

    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.discovered_count(), 0);
    assert!(!platform.is_scanning());
    client.stop().await;
}

#[tokio::test]
async fn test_unicast_connects_on_demand() {
    let (platform, client, _) = started_client(BleAdapterConfig::default()).await;
    platform.add_peer(PEER, PeerProfile::Complete);

    client
        .send_unicast("aa:bb:cc:00:00:01", b"direct")
        .await
        .expect("unicast");

    assert_eq!(platform.writes_to(PEER), vec![b"direct".to_vec()]);
    assert!(client.has_session(PEER));
    client.stop().await;
}

#[tokio::test]
async fn test_unicast_to_unreachable_peer_fails() {
    let config = BleAdapterConfig {
        connect_timeout_ms: 30,
        ..Default::default()
    };
    let (platform, client, _) = started_client(config).await;

    // Unknown to the stack: connect is refused outright
    assert!(matches!(
        client.send_unicast(PEER, b"x").await,
        Err(BleError::Failed(_))
    ));

    // Known but the link never comes up: bounded wait
    platform.add_peer(OTHER_PEER, PeerProfile::Complete);
    platform.set_connect_mode(ConnectMode::Manual);
    let started = Instant::now();
    assert!(matches!(
        client.send_unicast(OTHER_PEER, b"x").await,
        Err(BleError::Failed(_))
    ));
    assert!(started.elapsed() >= Duration::from_millis(30));
    client.stop().await;
}

#[tokio::test]
async fn test_write_timeout_fails_only_that_send() {
    let config = BleAdapterConfig {
        write_timeout_ms: 10,
        ..Default::default()
    };
    let (platform, client, _) = started_client(config).await;
    platform.add_peer(PEER, PeerProfile::Complete);
    client.send_unicast(PEER, b"first").await.expect("first");

    platform.set_write_mode(WriteMode::Manual);
    let started = Instant::now();
    let result = client.send_unicast(PEER, b"second").await;
    assert!(matches!(result, Err(BleError::SendFailed(_))));
    assert!(started.elapsed() >= Duration::from_millis(10));

    // Session survives the timeout
    assert!(client.has_session(PEER));
    platform.set_write_mode(WriteMode::AutoComplete);
    client.send_unicast(PEER, b"third").await.expect("third");
    client.stop().await;
}

#[tokio::test]
async fn test_multicast_failures_are_reported_per_peer() {
    let (platform, client, listener) = started_client(BleAdapterConfig::default()).await;
    platform.add_peer(PEER, PeerProfile::Complete);
    platform.add_peer(OTHER_PEER, PeerProfile::Complete);
    client.send_unicast(PEER, b"hi").await.unwrap();
    client.send_unicast(OTHER_PEER, b"hi").await.unwrap();

    platform.set_write_mode(WriteMode::Reject);
    client.send_multicast(b"fanout").await.expect("multicast succeeds");

    let errors = listener.send_errors.lock().clone();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|(_, data, error)| {
        data == b"fanout" && matches!(error, BleError::Failed(_))
    }));
    assert_eq!(client.pending_count(), 1);
    client.stop().await;
}

#[tokio::test]
async fn test_notifications_reach_listener() {
    let (platform, client, listener) = started_client(BleAdapterConfig::default()).await;
    platform.add_peer(PEER, PeerProfile::Complete);
    client.send_unicast(PEER, b"request").await.unwrap();

    assert!(platform.notify_from_peer(PEER, b"response"));
    wait_until("data received", || !listener.received.lock().is_empty()).await;

    assert_eq!(
        listener.received.lock()[0],
        (PEER.to_string(), b"response".to_vec())
    );
    client.stop().await;
}

#[tokio::test]
async fn test_disconnect_removes_session_and_allows_rediscovery() {
    let (platform, client, _) = started_client(BleAdapterConfig::default()).await;
    client.send_multicast(b"again").await.unwrap();
    platform.add_peer(PEER, PeerProfile::Complete);
    platform.advertise(matching(PEER));
    wait_until("session", || client.has_session(PEER)).await;

    platform.emit_connection_state(PEER, false);
    wait_until("session removed", || !client.has_session(PEER)).await;
    assert_eq!(platform.destroyed_clients().len(), 1);

    // Forgotten by the cache, so the next advertisement reconnects
    wait_until("scanning", || platform.is_scanning()).await;
    platform.advertise(matching(PEER));
    wait_until("rediscovered", || client.has_session(PEER)).await;
    assert_eq!(platform.writes_to(PEER).len(), 2);
    client.stop().await;
}

#[tokio::test]
async fn test_incomplete_peer_is_released() {
    let (platform, client, _) = started_client(BleAdapterConfig::default()).await;
    client.send_multicast(b"x").await.unwrap();
    platform.add_peer(PEER, PeerProfile::MissingRequestCharacteristic);
    platform.advertise(matching(PEER));

    wait_until("peer released", || {
        platform.disconnect_calls().contains(&PEER.to_string())
    })
    .await;
    assert_eq!(client.session_count(), 0);
    assert_eq!(platform.destroyed_clients().len(), 1);
    client.stop().await;
}

#[tokio::test]
async fn test_stop_releases_sessions() {
    let (platform, client, _) = started_client(BleAdapterConfig::default()).await;
    platform.add_peer(PEER, PeerProfile::Complete);
    client.send_unicast(PEER, b"hi").await.unwrap();

    client.stop().await;

    assert_eq!(client.session_count(), 0);
    assert!(platform.disconnect_calls().contains(&PEER.to_string()));
    assert!(matches!(
        client.send_unicast(PEER, b"late").await,
        Err(BleError::Failed(_))
    ));
    // Callbacks after stop are ignored
    platform.emit_connection_state(PEER, true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.session_count(), 0);
}

#[tokio::test]
async fn test_link_changes_scan_until_idle_timeout() {
    let config = BleAdapterConfig {
        scan_timeout_ms: 300,
        ..Default::default()
    };
    let (platform, client, _) = started_client(config).await;
    platform.add_peer(PEER, PeerProfile::Complete);
    assert_eq!(client.scan_state(), ScanState::Idle);

    // Link up without any multicast still starts discovery
    assert!(platform.emit_connection_state(PEER, true));
    wait_until("scan after link up", || {
        client.scan_state() == ScanState::Scanning && platform.is_scanning()
    })
    .await;
    wait_until("session discovered", || client.has_session(PEER)).await;

    assert!(platform.emit_connection_state(PEER, false));
    wait_until("session removed", || !client.has_session(PEER)).await;
    assert_eq!(client.scan_state(), ScanState::Scanning);

    // The countdown restarted by the link change eventually idles the scan
    wait_until("cycle expired", || client.scan_state() == ScanState::Idle).await;
    assert!(!platform.is_scanning());
    assert_eq!(client.pending_count(), 0);
    client.stop().await;
}
