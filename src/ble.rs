//! Production [`Transport`] backed by the `bluest` cross-platform BLE stack.
//!
//! Requests issued by the engine are turned into spawned tokio tasks that
//! perform the asynchronous platform call and report back through the
//! engine's event channel, so the engine itself never awaits the platform.
//! Discovery caches service and characteristic handles together with their
//! UUIDs, making later resolution a synchronous lookup.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::{pin_mut, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::transport::{
    CharacteristicHandle, ConnectionEvent, DeviceHandle, DiscoveryEvent, ReadEvent, ServiceHandle,
    SubscribeEvent, Transport, TransportEvent,
};
use crate::uuid::service_uuid;

/// Advertised GAP name of the voltage monitor firmware.
pub const DEFAULT_DEVICE_NAME: &str = "BLE_V_Monitor";

/// How long a device selection scan may run before it is declined.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Shared {
    adapter: Option<Adapter>,
    device: Option<Device>,
    radio_enabled: bool,
    /// Discovered services: UUID plus indices into `characteristics`.
    services: Vec<(Uuid, Vec<usize>)>,
    characteristics: Vec<(Uuid, Characteristic)>,
    /// In-flight platform operations, aborted on close.
    tasks: Vec<JoinHandle<()>>,
}

/// BLE transport over `bluest`. Device selection scans for an advertised
/// name, filtered on the monitor service UUID.
pub struct BluestTransport {
    device_name: String,
    scan_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Mutex<Shared>>,
}

impl BluestTransport {
    /// Create a transport reporting completions on `events`. Must be used
    /// from within a tokio runtime.
    pub fn new(device_name: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            device_name: device_name.into(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            events,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        self.shared.lock().unwrap().tasks.push(handle);
    }

    fn send(events: &mpsc::UnboundedSender<TransportEvent>, event: TransportEvent) {
        // The engine may already have shut down; nothing left to notify.
        let _ = events.send(event);
    }
}

/// Get the default adapter, waiting for it to become available, and cache it.
async fn acquire_adapter(shared: &Arc<Mutex<Shared>>) -> anyhow::Result<Adapter> {
    let cached = shared.lock().unwrap().adapter.clone();
    if let Some(adapter) = cached {
        return Ok(adapter);
    }

    let adapter = Adapter::default()
        .await
        .ok_or(anyhow!("Default adapter not found"))?;
    adapter.wait_available().await?;

    let mut guard = shared.lock().unwrap();
    guard.adapter = Some(adapter.clone());
    guard.radio_enabled = true;
    Ok(adapter)
}

/// Scan for an advertising device with the given name, bounded by
/// `scan_timeout`.
async fn select_device(
    shared: &Arc<Mutex<Shared>>,
    name: &str,
    scan_timeout: Duration,
) -> anyhow::Result<Device> {
    let adapter = acquire_adapter(shared).await?;
    let monitor_services = [service_uuid()];
    let scan = adapter.scan(&monitor_services).await?;
    pin_mut!(scan);

    let found = timeout(scan_timeout, async {
        while let Some(found) = scan.next().await {
            let found_name = found.device.name_async().await.unwrap_or_default();
            if found_name == name {
                return Some(found.device);
            }
        }
        None
    })
    .await
    .unwrap_or(None);

    found.ok_or(anyhow!("No device named '{name}' found"))
}

async fn discover(shared: &Arc<Mutex<Shared>>) -> anyhow::Result<()> {
    let device = shared
        .lock()
        .unwrap()
        .device
        .clone()
        .ok_or(anyhow!("No device selected"))?;

    let mut services = Vec::new();
    let mut characteristics = Vec::new();
    for service in device.discover_services().await? {
        let uuid = service.uuid_async().await?;
        let mut indices = Vec::new();
        for characteristic in service.discover_characteristics().await? {
            let characteristic_uuid = characteristic.uuid_async().await?;
            indices.push(characteristics.len());
            characteristics.push((characteristic_uuid, characteristic));
        }
        services.push((uuid, indices));
    }
    tracing::debug!(
        "discovered {} services, {} characteristics",
        services.len(),
        characteristics.len()
    );

    let mut guard = shared.lock().unwrap();
    guard.services = services;
    guard.characteristics = characteristics;
    Ok(())
}

impl Transport for BluestTransport {
    fn request_device_selection(&mut self) {
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let name = self.device_name.clone();
        let scan_timeout = self.scan_timeout;
        self.spawn(async move {
            match select_device(&shared, &name, scan_timeout).await {
                Ok(device) => {
                    let id = format!("{:?}", device.id());
                    tracing::info!("selected device '{name}' ({id})");
                    shared.lock().unwrap().device = Some(device);
                    Self::send(&events, TransportEvent::DeviceSelection(Some(DeviceHandle(id))));
                }
                Err(err) => {
                    tracing::warn!("device selection failed: {err}");
                    Self::send(&events, TransportEvent::DeviceSelection(None));
                }
            }
        });
    }

    fn request_radio_enable(&mut self) {
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        self.spawn(async move {
            let enabled = match acquire_adapter(&shared).await {
                Ok(_) => true,
                Err(err) => {
                    tracing::warn!("radio enable failed: {err}");
                    false
                }
            };
            Self::send(&events, TransportEvent::RadioEnable(enabled));
        });
    }

    fn radio_enabled(&self) -> bool {
        self.shared.lock().unwrap().radio_enabled
    }

    fn connect(&mut self, _device: &DeviceHandle) {
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        self.spawn(async move {
            let (adapter, device) = {
                let guard = shared.lock().unwrap();
                (guard.adapter.clone(), guard.device.clone())
            };
            let (Some(adapter), Some(device)) = (adapter, device) else {
                Self::send(
                    &events,
                    TransportEvent::Connection(ConnectionEvent::Disconnected),
                );
                return;
            };

            // Watch link state before connecting so no transition is missed.
            // The connect attempt itself reports the connected event; the
            // watcher only forwards disconnects.
            let watcher = {
                let adapter = adapter.clone();
                let device = device.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let Ok(connection_events) = adapter.device_connection_events(&device).await
                    else {
                        return;
                    };
                    pin_mut!(connection_events);
                    while let Some(event) = connection_events.next().await {
                        if let bluest::ConnectionEvent::Disconnected = event {
                            tracing::info!("device disconnected");
                            Self::send(
                                &events,
                                TransportEvent::Connection(ConnectionEvent::Disconnected),
                            );
                        }
                    }
                })
            };
            shared.lock().unwrap().tasks.push(watcher);

            match adapter.connect_device(&device).await {
                Ok(()) => {
                    Self::send(
                        &events,
                        TransportEvent::Connection(ConnectionEvent::Connected),
                    );
                }
                Err(err) => {
                    tracing::warn!("connect failed: {err}");
                    Self::send(
                        &events,
                        TransportEvent::Connection(ConnectionEvent::Disconnected),
                    );
                }
            }
        });
    }

    fn discover_services(&mut self) {
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        self.spawn(async move {
            let event = match discover(&shared).await {
                Ok(()) => DiscoveryEvent::Ok,
                Err(err) => {
                    tracing::warn!("service discovery failed: {err}");
                    DiscoveryEvent::Failed
                }
            };
            Self::send(&events, TransportEvent::Discovery(event));
        });
    }

    fn service(&self, uuid: Uuid) -> Option<ServiceHandle> {
        let guard = self.shared.lock().unwrap();
        guard
            .services
            .iter()
            .position(|(service_uuid, _)| *service_uuid == uuid)
            .map(ServiceHandle)
    }

    fn characteristic(&self, service: ServiceHandle, uuid: Uuid) -> Option<CharacteristicHandle> {
        let guard = self.shared.lock().unwrap();
        let (_, indices) = guard.services.get(service.0)?;
        indices
            .iter()
            .copied()
            .find(|index| {
                guard
                    .characteristics
                    .get(*index)
                    .is_some_and(|(characteristic_uuid, _)| *characteristic_uuid == uuid)
            })
            .map(CharacteristicHandle)
    }

    fn read_characteristic(&mut self, characteristic: CharacteristicHandle) {
        let cached = {
            let guard = self.shared.lock().unwrap();
            guard
                .characteristics
                .get(characteristic.0)
                .map(|(_, characteristic)| characteristic.clone())
        };
        let events = self.events.clone();
        self.spawn(async move {
            let Some(characteristic) = cached else {
                Self::send(&events, TransportEvent::Read(ReadEvent::Failed));
                return;
            };
            match characteristic.read().await {
                Ok(data) => {
                    tracing::debug!("read 0x{}", hex::encode(&data));
                    Self::send(&events, TransportEvent::Read(ReadEvent::Value(data)));
                }
                Err(err) => {
                    tracing::warn!("read failed: {err}");
                    Self::send(&events, TransportEvent::Read(ReadEvent::Failed));
                }
            }
        });
    }

    fn enable_indications(&mut self, characteristic: CharacteristicHandle) {
        let cached = {
            let guard = self.shared.lock().unwrap();
            guard
                .characteristics
                .get(characteristic.0)
                .map(|(_, characteristic)| characteristic.clone())
        };
        let events = self.events.clone();
        self.spawn(async move {
            let Some(characteristic) = cached else {
                Self::send(&events, TransportEvent::Subscribe(SubscribeEvent::Failed));
                return;
            };
            // bluest writes the client characteristic configuration
            // descriptor itself and uses indications when that is what the
            // characteristic supports.
            let subscription = match characteristic.notify().await {
                Ok(subscription) => subscription,
                Err(err) => {
                    tracing::warn!("enabling indications failed: {err}");
                    Self::send(&events, TransportEvent::Subscribe(SubscribeEvent::Failed));
                    return;
                }
            };
            Self::send(&events, TransportEvent::Subscribe(SubscribeEvent::Ok));

            pin_mut!(subscription);
            while let Some(item) = subscription.next().await {
                match item {
                    Ok(data) => {
                        tracing::debug!("indication 0x{}", hex::encode(&data));
                        Self::send(&events, TransportEvent::Indication(data));
                    }
                    Err(err) => {
                        tracing::warn!("indication stream error: {err}");
                        break;
                    }
                }
            }
        });
    }

    fn close(&mut self) {
        let (adapter, device) = {
            let mut guard = self.shared.lock().unwrap();
            for task in guard.tasks.drain(..) {
                task.abort();
            }
            guard.services.clear();
            guard.characteristics.clear();
            // The adapter and device identity survive for the next task.
            (guard.adapter.clone(), guard.device.clone())
        };
        if let (Some(adapter), Some(device)) = (adapter, device) {
            tokio::spawn(async move {
                if let Err(err) = adapter.disconnect_device(&device).await {
                    tracing::debug!("disconnect: {err}");
                }
            });
        }
    }
}
