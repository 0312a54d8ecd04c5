//! Bluetooth peripheral management
//! This module handles the catalog of supported services, payload decoding,
//! the peripheral registry, the known-device cache and the orchestrator that
//! drives scanning, connection and polling.

pub mod attribute;
pub mod cache;
pub mod commands;
pub mod constants;
pub mod decoder;
pub mod events;
pub mod fake;
pub mod registry;
pub mod store;
pub mod types;

mod connection;
mod handle;
mod manager;
mod notification;
mod polling;
mod scanner;

#[cfg(feature = "bluest")]
mod bluest_adapter;

// Re-export types that should be publicly accessible
pub use attribute::{
    Attribute, AttributeId, CharacteristicKind, Registrations, ServiceDescriptor, ServiceKind,
    resolve,
};
#[cfg(feature = "bluest")]
pub use bluest_adapter::BluestAdapter;
pub use cache::{CachedDeviceEntry, DeviceCache};
pub use commands::{Adapter, AdapterCommand, Authorization};
pub use decoder::{BodySensorLocation, CharacteristicValue, DecodeError, decode};
pub use events::{
    AdapterEvent, CharacteristicProperties, DiscoveredCharacteristic, HardwareState,
    RetrievedPeripheral,
};
pub use fake::FakeAdapter;
pub use handle::Bluetooth;
pub use manager::{BluetoothManager, ManagerCommand};
pub use registry::{PeripheralRegistry, PeripheralStream, RegistryChange};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoreError};
pub use types::{
    BluetoothState, ConnectionState, PeripheralId, PeripheralRecord, PeripheralStatus,
    PollingPolicy, SignalStrength,
};
