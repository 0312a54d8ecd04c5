//! Events reported by the radio adapter

use crate::core::bluetooth::attribute::AttributeId;
use crate::core::bluetooth::types::{ConnectionState, PeripheralId};

/// Power state of the radio hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

/// Access a characteristic supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub id: AttributeId,
    pub properties: CharacteristicProperties,
}

/// A peripheral returned by a retrieve command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub state: ConnectionState,
}

/// Adapter events. Failures carry the adapter's error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    HardwareStateChanged(HardwareState),
    PeripheralDiscovered {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
        advertised_services: Vec<AttributeId>,
    },
    PeripheralConnected {
        peripheral: PeripheralId,
        name: Option<String>,
    },
    ConnectionFailed {
        peripheral: PeripheralId,
        error: String,
    },
    PeripheralDisconnected {
        peripheral: PeripheralId,
        error: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Result<Vec<AttributeId>, String>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: AttributeId,
        characteristics: Result<Vec<DiscoveredCharacteristic>, String>,
    },
    CharacteristicValueUpdated {
        peripheral: PeripheralId,
        characteristic: AttributeId,
        value: Result<Vec<u8>, String>,
    },
    RssiRead {
        peripheral: PeripheralId,
        rssi: Result<i16, String>,
    },
    PeripheralsRetrieved(Vec<RetrievedPeripheral>),
}

/// Ticks sent back to the orchestrator by its own timers. The generation
/// lets the orchestrator ignore ticks from a timer it already replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    ScanTimeout { generation: u64 },
    PollTick { peripheral: PeripheralId, generation: u64 },
    PollExpired { peripheral: PeripheralId, generation: u64 },
}
