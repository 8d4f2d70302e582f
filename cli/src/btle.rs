// Desktop radio binding over btleplug
//
// Implements the central half of the platform traits on top of the first
// local adapter btleplug finds (BlueZ, CoreBluetooth or WinRT). btleplug has
// no peripheral/GATT-server API, so the CLI only ever runs the client role.
//
// CoreBluetooth hides MAC addresses and reports 00:00:00:00:00:00 for every
// peripheral; there the opaque PeripheralId stands in as the address.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use ocfble_core::transport::ble::{
    AdapterStateCallback, CharacteristicHandle, ClientHandle, ConnectionStateCallback,
    NotifyCallback, ScanCallback, ServiceHandle, WriteCallback,
};
use ocfble_core::{AdapterControl, GattClientPlatform, PlatformError, ScanResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

type SharedScanCallback = Arc<dyn Fn(ScanResult) + Send + Sync>;
type SharedConnectionCallback = Arc<dyn Fn(String, bool) + Send + Sync>;

#[derive(Default)]
struct BtleState {
    peripherals: HashMap<String, Peripheral>,
    clients: HashMap<u64, String>,
    services: HashMap<u64, (String, Uuid)>,
    characteristics: HashMap<u64, (String, Characteristic)>,
    staged: HashMap<u64, Vec<u8>>,
    notify_tasks: HashMap<u64, JoinHandle<()>>,
    next_handle: u64,
    on_scan_result: Option<SharedScanCallback>,
    on_connection: Option<SharedConnectionCallback>,
}

impl BtleState {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn peripheral(&self, address: &str) -> Result<Peripheral, PlatformError> {
        self.peripherals
            .get(address)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(address.to_string()))
    }
}

pub struct BtlePlatform {
    adapter: Adapter,
    state: Mutex<BtleState>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtlePlatform {
    /// Open the first Bluetooth adapter and start pumping its central events
    pub async fn open() -> anyhow::Result<Arc<Self>> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;

        let platform = Arc::new(Self {
            adapter,
            state: Mutex::new(BtleState::default()),
            event_task: Mutex::new(None),
        });

        let mut events = platform.adapter.events().await?;
        let pump = platform.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                pump.handle_central_event(event).await;
            }
            tracing::debug!("btleplug event stream closed");
        });
        *platform.event_task.lock() = Some(handle);
        Ok(platform)
    }

    /// Stop the event pump and any notification readers
    pub fn close(&self) {
        if let Some(handle) = self.event_task.lock().take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        for (_, task) in state.notify_tasks.drain() {
            task.abort();
        }
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                let sink = self.state.lock().on_scan_result.clone();
                let Some(sink) = sink else { return };
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let address = peripheral_key(&peripheral);
                let result = match peripheral.properties().await {
                    Ok(Some(props)) => ScanResult {
                        address: address.clone(),
                        service_uuids: props.services,
                        rssi: props.rssi,
                        local_name: props.local_name,
                    },
                    _ => ScanResult::new(address.clone(), Vec::new()),
                };
                self.state.lock().peripherals.insert(address, peripheral);
                sink(result);
            }
            CentralEvent::DeviceDisconnected(id) => {
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let callback = self.state.lock().on_connection.clone();
                if let Some(callback) = callback {
                    callback(peripheral_key(&peripheral), false);
                }
            }
            _ => {}
        }
    }

    fn characteristic(
        &self,
        handle: CharacteristicHandle,
    ) -> Result<(Peripheral, Characteristic), PlatformError> {
        let state = self.state.lock();
        let (address, characteristic) = state
            .characteristics
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(handle.to_string()))?;
        Ok((state.peripheral(&address)?, characteristic))
    }
}

/// Address the core sees for `peripheral`
fn peripheral_key(peripheral: &Peripheral) -> String {
    address_key(peripheral.address(), || format!("{:?}", peripheral.id()))
}

fn address_key(address: BDAddr, id: impl FnOnce() -> String) -> String {
    if address == BDAddr::default() {
        id().to_ascii_uppercase()
    } else {
        address.to_string()
    }
}

fn platform_error(err: btleplug::Error) -> PlatformError {
    match err {
        btleplug::Error::NotSupported(_) => PlatformError::NotSupported,
        btleplug::Error::DeviceNotFound => PlatformError::NotFound("device".to_string()),
        other => PlatformError::Io(other.to_string()),
    }
}

#[async_trait]
impl GattClientPlatform for BtlePlatform {
    async fn scan_start(&self, on_result: ScanCallback) -> Result<(), PlatformError> {
        self.state.lock().on_scan_result = Some(Arc::from(on_result));
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(platform_error)
    }

    async fn scan_stop(&self) -> Result<(), PlatformError> {
        self.state.lock().on_scan_result = None;
        self.adapter.stop_scan().await.map_err(platform_error)
    }

    async fn connect(&self, address: &str, _auto_connect: bool) -> Result<(), PlatformError> {
        let peripheral = self.state.lock().peripheral(address)?;
        peripheral.connect().await.map_err(platform_error)?;
        // btleplug resolves `connect` once the link is up
        let callback = self.state.lock().on_connection.clone();
        if let Some(callback) = callback {
            callback(address.to_string(), true);
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), PlatformError> {
        let peripheral = self.state.lock().peripheral(address)?;
        peripheral.disconnect().await.map_err(platform_error)
    }

    async fn is_profile_connected(&self, address: &str) -> Result<bool, PlatformError> {
        let peripheral = match self.state.lock().peripheral(address) {
            Ok(peripheral) => peripheral,
            Err(_) => return Ok(false),
        };
        peripheral.is_connected().await.map_err(platform_error)
    }

    async fn create_client(&self, address: &str) -> Result<ClientHandle, PlatformError> {
        let peripheral = self.state.lock().peripheral(address)?;
        peripheral.discover_services().await.map_err(platform_error)?;
        let mut state = self.state.lock();
        let handle = state.mint();
        state.clients.insert(handle, address.to_string());
        Ok(ClientHandle(handle))
    }

    async fn destroy_client(&self, client: ClientHandle) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let address = state
            .clients
            .remove(&client.0)
            .ok_or_else(|| PlatformError::NotFound(client.to_string()))?;
        state.services.retain(|_, (owner, _)| *owner != address);
        let released: Vec<u64> = state
            .characteristics
            .iter()
            .filter(|(_, (owner, _))| *owner == address)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in released {
            state.characteristics.remove(&handle);
            state.staged.remove(&handle);
            if let Some(task) = state.notify_tasks.remove(&handle) {
                task.abort();
            }
        }
        Ok(())
    }

    async fn discover_service(
        &self,
        client: ClientHandle,
        uuid: &Uuid,
    ) -> Result<ServiceHandle, PlatformError> {
        let (address, peripheral) = {
            let state = self.state.lock();
            let address = state
                .clients
                .get(&client.0)
                .cloned()
                .ok_or_else(|| PlatformError::NotFound(client.to_string()))?;
            let peripheral = state.peripheral(&address)?;
            (address, peripheral)
        };
        if !peripheral.services().iter().any(|s| s.uuid == *uuid) {
            return Err(PlatformError::NotFound(format!("service {}", uuid)));
        }
        let mut state = self.state.lock();
        let handle = state.mint();
        state.services.insert(handle, (address, *uuid));
        Ok(ServiceHandle(handle))
    }

    async fn discover_characteristic(
        &self,
        service: ServiceHandle,
        uuid: &Uuid,
    ) -> Result<CharacteristicHandle, PlatformError> {
        let (address, service_uuid, peripheral) = {
            let state = self.state.lock();
            let (address, service_uuid) = state
                .services
                .get(&service.0)
                .cloned()
                .ok_or_else(|| PlatformError::NotFound(service.to_string()))?;
            let peripheral = state.peripheral(&address)?;
            (address, service_uuid, peripheral)
        };
        let characteristic = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service_uuid)
            .and_then(|s| s.characteristics.into_iter().find(|c| c.uuid == *uuid))
            .ok_or_else(|| PlatformError::NotFound(format!("characteristic {}", uuid)))?;
        let mut state = self.state.lock();
        let handle = state.mint();
        state.characteristics.insert(handle, (address, characteristic));
        Ok(CharacteristicHandle(handle))
    }

    async fn set_characteristic_value(
        &self,
        characteristic: CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        if !state.characteristics.contains_key(&characteristic.0) {
            return Err(PlatformError::NotFound(characteristic.to_string()));
        }
        state.staged.insert(characteristic.0, value.to_vec());
        Ok(())
    }

    async fn write_characteristic(
        &self,
        characteristic: CharacteristicHandle,
        on_complete: WriteCallback,
    ) -> Result<(), PlatformError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        let value = self
            .state
            .lock()
            .staged
            .remove(&characteristic.0)
            .ok_or_else(|| PlatformError::Rejected("no value staged".to_string()))?;
        tokio::spawn(async move {
            let result = peripheral
                .write(&target, &value, WriteType::WithResponse)
                .await
                .map_err(platform_error);
            on_complete(result);
        });
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        characteristic: CharacteristicHandle,
        on_notify: NotifyCallback,
    ) -> Result<(), PlatformError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        peripheral.subscribe(&target).await.map_err(platform_error)?;
        let mut stream = peripheral.notifications().await.map_err(platform_error)?;
        let address = peripheral_key(&peripheral);
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == target.uuid {
                    on_notify(address.clone(), notification.value);
                }
            }
        });
        if let Some(previous) = self.state.lock().notify_tasks.insert(characteristic.0, task) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe_notifications(
        &self,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError> {
        let (peripheral, target) = self.characteristic(characteristic)?;
        if let Some(task) = self.state.lock().notify_tasks.remove(&characteristic.0) {
            task.abort();
        }
        peripheral.unsubscribe(&target).await.map_err(platform_error)
    }

    fn set_on_connection_state_changed(&self, callback: ConnectionStateCallback) {
        self.state.lock().on_connection = Some(Arc::from(callback));
    }
}

#[async_trait]
impl AdapterControl for BtlePlatform {
    async fn is_enabled(&self) -> Result<bool, PlatformError> {
        // btleplug only hands out adapters the OS reports as present
        Ok(self.adapter.adapter_info().await.is_ok())
    }

    async fn local_address(&self) -> Result<String, PlatformError> {
        self.adapter.adapter_info().await.map_err(platform_error)
    }

    fn set_on_adapter_state_changed(&self, _callback: AdapterStateCallback) {
        // btleplug 0.11 does not surface adapter power changes
        tracing::debug!("Adapter state callback ignored by btleplug binding");
    }
}
