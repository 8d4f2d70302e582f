/// Addresses already seen during the current scan cycle
///
/// Scan results for an address in this set are dropped without work. Matches
/// and non-matches are both recorded; the whole set is cleared when a scan
/// cycle times out, and single entries are forgotten on disconnect so the
/// device can be rediscovered.

use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct DiscoveredDeviceCache {
    addresses: Mutex<HashSet<String>>,
}

impl DiscoveredDeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address`; returns `false` if it was already present
    pub fn insert(&self, address: &str) -> bool {
        self.addresses.lock().insert(address.to_string())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.lock().contains(address)
    }

    pub fn remove(&self, address: &str) -> bool {
        self.addresses.lock().remove(address)
    }

    pub fn clear(&self) {
        self.addresses.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.addresses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.lock().is_empty()
    }
}
