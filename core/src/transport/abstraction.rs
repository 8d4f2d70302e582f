//! Transport abstraction layer for the BLE adapter
//!
//! Defines the error taxonomy and the upward-facing callbacks that a
//! transport-selection layer registers to receive data, send failures and
//! connection state changes.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the adapter to its callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// Null, empty or otherwise malformed input
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
    /// Generic platform call failure (connect, discover or write rejected by the stack)
    #[error("Operation failed: {0}")]
    Failed(String),
    /// Write was issued but no completion arrived within the timeout
    #[error("Send failed: {0}")]
    SendFailed(String),
    /// Buffer could not be allocated or a bounded buffer is full
    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(String),
    /// Feature is gated by a platform capability or role that is not available
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl BleError {
    /// Short, stable code for logs and upward error callbacks
    pub fn code(&self) -> &'static str {
        match self {
            BleError::InvalidParam(_) => "INVALID_PARAM",
            BleError::Failed(_) => "FAILED",
            BleError::SendFailed(_) => "SEND_FAILED",
            BleError::MemoryAllocation(_) => "MEMORY_ALLOC_FAILED",
            BleError::NotSupported(_) => "NOT_SUPPORTED",
        }
    }
}

/// Which side of the GATT link a transport event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// We are the GATT client, the peer is a GATT server
    Client,
    /// We are the GATT server, the peer is a GATT client
    Server,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Client => write!(f, "client"),
            LinkRole::Server => write!(f, "server"),
        }
    }
}

/// Callbacks delivered to the transport-selection layer above the adapter.
///
/// Implementations must return quickly: they run on the adapter's event loop.
#[cfg_attr(test, mockall::automock)]
pub trait LeEventListener: Send + Sync {
    /// Bytes arrived from `address` (notification in client role, write request in server role)
    fn on_data_received(&self, address: &str, data: &[u8]);

    /// A payload could not be delivered to `address`
    fn on_send_error(&self, address: &str, data: &[u8], error: &BleError);

    /// The local Bluetooth adapter was switched on or off
    fn on_adapter_state_changed(&self, _enabled: bool) {}
}

/// Handler for peer connection state changes: `(address, connected)`
pub type ConnectionStateHandler = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Late-bound slot holding the upward listener and connection handler.
///
/// Shared by every component that reports upward; cloning shares the slot.
#[derive(Clone, Default)]
pub struct ListenerSlot {
    listener: Arc<RwLock<Option<Arc<dyn LeEventListener>>>>,
    connection_handler: Arc<RwLock<Option<ConnectionStateHandler>>>,
}

impl ListenerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listener(&self, listener: Arc<dyn LeEventListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    pub fn set_connection_handler(&self, handler: ConnectionStateHandler) {
        *self.connection_handler.write() = Some(handler);
    }

    /// Forward received bytes to the listener, if any
    pub fn data_received(&self, address: &str, data: &[u8]) {
        // Clone out so the callback never runs under our lock
        let listener = self.listener.read().clone();
        match listener {
            Some(listener) => listener.on_data_received(address, data),
            None => tracing::debug!(address, len = data.len(), "No listener, dropping inbound data"),
        }
    }

    /// Forward a per-peer send failure to the listener, if any
    pub fn send_error(&self, address: &str, data: &[u8], error: &BleError) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_send_error(address, data, error);
        }
    }

    pub fn adapter_state_changed(&self, enabled: bool) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_adapter_state_changed(enabled);
        }
    }

    pub fn connection_state_changed(&self, address: &str, connected: bool) {
        let handler = self.connection_handler.read().clone();
        if let Some(handler) = handler {
            handler(address, connected);
        }
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSlot")
            .field("listener", &self.listener.read().is_some())
            .field("connection_handler", &self.connection_handler.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = vec![
            BleError::InvalidParam("x".into()),
            BleError::Failed("x".into()),
            BleError::SendFailed("x".into()),
            BleError::MemoryAllocation("x".into()),
            BleError::NotSupported("x".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 5);
    }

    #[test]
    fn test_slot_without_listener_is_noop() {
        let slot = ListenerSlot::new();
        slot.data_received("AA:BB:CC:DD:EE:FF", b"abc");
        slot.send_error("AA:BB:CC:DD:EE:FF", b"abc", &BleError::Failed("x".into()));
        slot.connection_state_changed("AA:BB:CC:DD:EE:FF", true);
    }

    #[test]
    fn test_slot_forwards_to_listener() {
        let mut mock = MockLeEventListener::new();
        mock.expect_on_data_received()
            .withf(|addr, data| addr == "AA:BB:CC:DD:EE:FF" && data == b"hello")
            .times(1)
            .return_const(());
        mock.expect_on_send_error()
            .withf(|addr, data, err| {
                addr == "11:22:33:44:55:66" && data == b"x" && matches!(err, BleError::SendFailed(_))
            })
            .times(1)
            .return_const(());

        let slot = ListenerSlot::new();
        slot.set_listener(Arc::new(mock));
        slot.data_received("AA:BB:CC:DD:EE:FF", b"hello");
        slot.send_error("11:22:33:44:55:66", b"x", &BleError::SendFailed("timeout".into()));
    }

    #[test]
    fn test_connection_handler_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let slot = ListenerSlot::new();
        slot.set_connection_handler(Arc::new(move |addr: &str, connected: bool| {
            assert_eq!(addr, "AA:BB:CC:DD:EE:FF");
            assert!(connected);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let shared = slot.clone();
        shared.connection_state_changed("AA:BB:CC:DD:EE:FF", true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
