//! The interface between the task engine and the concrete BLE stack.
//!
//! The engine drives the transport through fire-and-forget requests and
//! consumes typed completion events from a channel, so it never blocks on
//! the platform and never cares which thread a completion originated on.
//! [`crate::ble::BluestTransport`] is the production implementation.

use bluest::Uuid;

/// Identity of a selected peer device. Persists across tasks once chosen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub String);

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a discovered GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle(pub usize);

/// Opaque handle to a resolved GATT characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Value(Vec<u8>),
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeEvent {
    Ok,
    Failed,
}

/// Asynchronous completion events delivered by a [`Transport`] to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Outcome of a device selection prerequisite. `None` means the user
    /// declined or no suitable device was found.
    DeviceSelection(Option<DeviceHandle>),
    /// Outcome of a radio enable prerequisite.
    RadioEnable(bool),
    Connection(ConnectionEvent),
    Discovery(DiscoveryEvent),
    Read(ReadEvent),
    Subscribe(SubscribeEvent),
    /// One indication value pushed by the device.
    Indication(Vec<u8>),
}

/// Abstraction over the BLE stack as the task engine sees it.
///
/// Request methods issue the operation and return immediately; the matching
/// [`TransportEvent`] arrives later on the event channel the transport was
/// constructed with. Resolution of discovered services and characteristics
/// is a synchronous lookup against state cached during discovery.
pub trait Transport: Send {
    /// Ask for a device to be selected (scan, picker UI, ...).
    /// Completes with [`TransportEvent::DeviceSelection`].
    fn request_device_selection(&mut self);

    /// Ask for the radio to be turned on.
    /// Completes with [`TransportEvent::RadioEnable`].
    fn request_radio_enable(&mut self);

    /// Whether the radio is currently usable.
    fn radio_enabled(&self) -> bool;

    /// Open a link to the device. Completes with
    /// [`TransportEvent::Connection`]; later disconnects arrive on the same
    /// channel unprompted.
    fn connect(&mut self, device: &DeviceHandle);

    /// Enumerate the peer's GATT services and their characteristics.
    /// Completes with [`TransportEvent::Discovery`].
    fn discover_services(&mut self);

    /// Look up a discovered service by UUID.
    fn service(&self, uuid: Uuid) -> Option<ServiceHandle>;

    /// Look up a characteristic of a discovered service by UUID.
    fn characteristic(&self, service: ServiceHandle, uuid: Uuid) -> Option<CharacteristicHandle>;

    /// Read the characteristic value once. Completes with
    /// [`TransportEvent::Read`].
    fn read_characteristic(&mut self, characteristic: CharacteristicHandle);

    /// Subscribe to indications on the characteristic, including the remote
    /// enable-indication descriptor write. Completes with
    /// [`TransportEvent::Subscribe`], then one
    /// [`TransportEvent::Indication`] per pushed value.
    fn enable_indications(&mut self, characteristic: CharacteristicHandle);

    /// Tear the link down and release all handles. Must be safe to call at
    /// any time, including when nothing is open.
    fn close(&mut self);
}

/// Decode a little-endian signed 16 bit value from a characteristic payload.
///
/// Returns `None` when the payload is too short; extra trailing bytes are
/// ignored.
pub fn decode_sint16_le(data: &[u8]) -> Option<i16> {
    let bytes = data.get(..2)?;
    Some(i16::from_le_bytes([bytes[0], bytes[1]]))
}
