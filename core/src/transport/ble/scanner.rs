/// LE scan state machine for the client role
///
/// Scanning is driven by multicast traffic and link changes: the first
/// multicast send or connection-state change arms a scan cycle and starts the
/// platform scan; every later one restarts the cycle's idle countdown. A matching advertisement pauses the
/// scan while the connect runs, after which scanning resumes as long as the
/// cycle is still armed. When the countdown expires the scan stops and both
/// the discovered-device cache and the pending multicast queue are dropped.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device_cache::DiscoveredDeviceCache;
use super::gatt::{normalize_address, ScanResult};
use super::pending::PendingSendQueue;
use super::platform::{GattClientPlatform, ScanCallback};
use crate::transport::abstraction::BleError;

/// Where the platform scan callback forwards advertisements
pub type ScanResultSink = Arc<dyn Fn(ScanResult) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No platform scan and no armed cycle
    Idle,
    /// Platform scan running
    Scanning,
    /// Scan paused for a connect; cycle timer still armed
    WaitingOnMulticastSignal,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Scanning => write!(f, "scanning"),
            ScanState::WaitingOnMulticastSignal => write!(f, "waiting-on-multicast"),
        }
    }
}

/// What the client should do with one advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanDecision {
    /// Address seen before in this cycle, or the scanner is stopped
    Ignored,
    /// New address without our service
    Recorded,
    /// New address advertising our service; scan has been paused
    Connect(String),
}

struct ScanInner {
    state: ScanState,
    cycle_armed: bool,
    /// Bumped on every multicast or link signal
    activity: u64,
}

pub struct ScanController {
    platform: Arc<dyn GattClientPlatform>,
    cache: Arc<DiscoveredDeviceCache>,
    pending: Arc<PendingSendQueue>,
    service_uuid: Uuid,
    idle_timeout: Duration,
    sink: Mutex<Option<ScanResultSink>>,
    inner: Mutex<ScanInner>,
    /// Held across each platform scan start/stop so transitions do not interleave
    radio: AsyncMutex<()>,
    cycle_signal: Notify,
    running: AtomicBool,
}

impl ScanController {
    pub fn new(
        platform: Arc<dyn GattClientPlatform>,
        cache: Arc<DiscoveredDeviceCache>,
        pending: Arc<PendingSendQueue>,
        service_uuid: Uuid,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            platform,
            cache,
            pending,
            service_uuid,
            idle_timeout,
            sink: Mutex::new(None),
            inner: Mutex::new(ScanInner {
                state: ScanState::Idle,
                cycle_armed: false,
                activity: 0,
            }),
            radio: AsyncMutex::new(()),
            cycle_signal: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Accept scan work, forwarding platform results into `sink`
    pub fn start(&self, sink: ScanResultSink) {
        *self.sink.lock() = Some(sink);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> ScanState {
        self.inner.lock().state
    }

    pub fn is_cycle_armed(&self) -> bool {
        self.inner.lock().cycle_armed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the platform scan. A no-op while already scanning.
    pub async fn start_scanning(&self) -> Result<(), BleError> {
        if !self.is_running() {
            return Err(BleError::Failed("scanner is stopped".to_string()));
        }
        let sink = self
            .sink
            .lock()
            .clone()
            .ok_or_else(|| BleError::Failed("no scan result sink".to_string()))?;

        let _radio = self.radio.lock().await;
        let previous = {
            let mut inner = self.inner.lock();
            if inner.state == ScanState::Scanning {
                return Ok(());
            }
            let previous = inner.state;
            inner.state = ScanState::Scanning;
            previous
        };

        let on_result: ScanCallback = Box::new(move |result| sink(result));
        if let Err(e) = self.platform.scan_start(on_result).await {
            warn!("Failed to start LE scan: {}", e);
            let mut inner = self.inner.lock();
            if inner.state == ScanState::Scanning {
                inner.state = previous;
            }
            return Err(e.into());
        }

        info!(service = %self.service_uuid, "LE scan started");
        Ok(())
    }

    /// Stop the platform scan, keeping the cycle armed if it is
    pub async fn stop_scanning(&self) {
        let _radio = self.radio.lock().await;
        let was_scanning = {
            let mut inner = self.inner.lock();
            let was_scanning = inner.state == ScanState::Scanning;
            inner.state = if inner.cycle_armed {
                ScanState::WaitingOnMulticastSignal
            } else {
                ScanState::Idle
            };
            was_scanning
        };

        if was_scanning {
            if let Err(e) = self.platform.scan_stop().await {
                warn!("Failed to stop LE scan: {}", e);
            } else {
                debug!("LE scan stopped");
            }
        }
    }

    /// Classify one advertisement.
    ///
    /// Every new address is recorded in the cache whether or not it matches,
    /// so each device is inspected once per cycle.
    pub async fn on_scan_result(&self, result: &ScanResult) -> ScanDecision {
        if !self.is_running() {
            return ScanDecision::Ignored;
        }
        let address = match normalize_address(&result.address) {
            Ok(address) => address,
            Err(_) => return ScanDecision::Ignored,
        };
        if !self.cache.insert(&address) {
            return ScanDecision::Ignored;
        }
        if !result.advertises(&self.service_uuid) {
            debug!(address = %address, "Device does not advertise the transport service");
            return ScanDecision::Recorded;
        }

        info!(address = %address, rssi = ?result.rssi, "Found transport service");
        self.stop_scanning().await;
        ScanDecision::Connect(address)
    }

    /// Arm the idle timer, or restart its countdown if it is already armed
    pub fn begin_multicast_cycle(self: &Arc<Self>) {
        self.signal_cycle("multicast");
    }

    /// A link came up or went down: same effect on the cycle as a multicast
    pub fn signal_link_activity(self: &Arc<Self>) {
        self.signal_cycle("link change");
    }

    fn signal_cycle(self: &Arc<Self>, reason: &'static str) {
        if !self.is_running() {
            return;
        }
        let arm = {
            let mut inner = self.inner.lock();
            inner.activity += 1;
            if inner.cycle_armed {
                false
            } else {
                inner.cycle_armed = true;
                true
            }
        };

        if arm {
            debug!(
                reason,
                timeout_ms = self.idle_timeout.as_millis() as u64,
                "Scan cycle armed"
            );
            tokio::spawn(self.clone().run_cycle_timer());
        } else {
            self.cycle_signal.notify_waiters();
        }
    }

    /// Resume scanning after a connect attempt if the cycle is still armed
    pub async fn resume_if_cycle_active(&self) -> Result<(), BleError> {
        if self.is_running() && self.is_cycle_armed() {
            self.start_scanning().await
        } else {
            Ok(())
        }
    }

    /// Stop scanning, disarm the cycle and forget discovered devices
    pub async fn reset(&self) {
        let _radio = self.radio.lock().await;
        let was_scanning = {
            let mut inner = self.inner.lock();
            let was_scanning = inner.state == ScanState::Scanning;
            inner.state = ScanState::Idle;
            inner.cycle_armed = false;
            was_scanning
        };
        self.cycle_signal.notify_waiters();

        if was_scanning {
            if let Err(e) = self.platform.scan_stop().await {
                warn!("Failed to stop LE scan: {}", e);
            }
        }
        self.cache.clear();
    }

    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.reset().await;
        *self.sink.lock() = None;
    }

    async fn run_cycle_timer(self: Arc<Self>) {
        loop {
            let notified = self.cycle_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let seen = {
                let inner = self.inner.lock();
                if !self.is_running() || !inner.cycle_armed {
                    return;
                }
                inner.activity
            };

            tokio::select! {
                _ = tokio::time::sleep(self.idle_timeout) => {
                    if self.expire_cycle(seen).await {
                        return;
                    }
                }
                _ = &mut notified => {
                    debug!("Scan idle timer restarted");
                }
            }
        }
    }

    /// End the cycle if nothing signalled it since `seen`. Returns `false`
    /// when a signal raced the timeout and the cycle keeps running.
    async fn expire_cycle(&self, seen: u64) -> bool {
        let _radio = self.radio.lock().await;
        let (was_scanning, dropped) = {
            let mut inner = self.inner.lock();
            if !inner.cycle_armed {
                return true;
            }
            if inner.activity != seen {
                return false;
            }
            inner.cycle_armed = false;
            let was_scanning = inner.state == ScanState::Scanning;
            inner.state = ScanState::Idle;
            // Cleared under the lock: a racing multicast lands in the next cycle
            self.cache.clear();
            (was_scanning, self.pending.clear())
        };

        if was_scanning {
            if let Err(e) = self.platform.scan_stop().await {
                warn!("Failed to stop LE scan: {}", e);
            }
        }

        if dropped > 0 {
            warn!(
                dropped,
                "Scan cycle timed out, discarding undelivered multicast payloads"
            );
        } else {
            info!("Scan cycle timed out");
        }
        true
    }
}
