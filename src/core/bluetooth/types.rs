//! Defines shared data structures for the Bluetooth module.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::attribute::{CharacteristicKind, ServiceDescriptor};
use crate::core::bluetooth::constants::{
    RSSI_EXCELLENT_THRESHOLD, RSSI_FAIR_THRESHOLD, RSSI_GOOD_THRESHOLD, UNNAMED_DEVICE,
};
use crate::core::bluetooth::decoder::{BodySensorLocation, CharacteristicValue};

/// Platform-assigned identifier of a peripheral, stable across sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Connection state as last reported by the adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Coarse signal quality bucket derived from an RSSI sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStrength {
    Excellent,
    Good,
    Fair,
    Weak,
}

impl SignalStrength {
    pub fn from_rssi(rssi: i16) -> Self {
        let n = rssi.min(0);
        if n >= RSSI_EXCELLENT_THRESHOLD {
            Self::Excellent
        } else if n >= RSSI_GOOD_THRESHOLD {
            Self::Good
        } else if n >= RSSI_FAIR_THRESHOLD {
            Self::Fair
        } else {
            Self::Weak
        }
    }
}

/// How often, and for how long, to sample RSSI on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingPolicy {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl PollingPolicy {
    pub fn new(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval_secs,
            timeout_secs,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Status of a peripheral for the purposes of display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralStatus {
    Available,
    Known,
    Connected,
}

/// Everything known about one peripheral
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralRecord {
    pub id: PeripheralId,
    pub connection_state: ConnectionState,
    /// The user (or manufacturer provided) name of the peripheral
    pub name: Option<String>,
    /// Services confirmed present on the device. `None` until discovery completes.
    pub services: Option<Vec<ServiceDescriptor>>,
    /// Whether the device has been connected before and is remembered
    pub is_known: bool,
    /// Last decoded value per characteristic
    pub values: BTreeMap<CharacteristicKind, CharacteristicValue>,
    /// The most recent raw RSSI sample
    pub rssi: Option<i16>,
    pub signal_strength: Option<SignalStrength>,
    pub polling: Option<PollingPolicy>,
}

impl PeripheralRecord {
    pub fn new(id: PeripheralId) -> Self {
        Self {
            id,
            connection_state: ConnectionState::Disconnected,
            name: None,
            services: None,
            is_known: false,
            values: BTreeMap::new(),
            rssi: None,
            signal_strength: None,
            polling: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED_DEVICE)
    }

    pub fn status(&self) -> PeripheralStatus {
        if self.connection_state == ConnectionState::Connected {
            PeripheralStatus::Connected
        } else if self.is_known {
            PeripheralStatus::Known
        } else {
            PeripheralStatus::Available
        }
    }

    /// Records an RSSI sample and the signal strength derived from it
    pub fn set_rssi(&mut self, rssi: i16) {
        self.rssi = Some(rssi);
        self.signal_strength = Some(SignalStrength::from_rssi(rssi));
    }

    pub fn set_value(&mut self, value: CharacteristicValue) {
        self.values.insert(value.kind(), value);
    }

    /// Battery level in percent, if read
    pub fn battery_level(&self) -> Option<u8> {
        match self.values.get(&CharacteristicKind::BatteryLevel) {
            Some(CharacteristicValue::BatteryLevel(level)) => Some(*level),
            _ => None,
        }
    }

    /// Heart rate in bpm, if measured
    pub fn heart_rate(&self) -> Option<u16> {
        match self.values.get(&CharacteristicKind::HeartRateMeasurement) {
            Some(CharacteristicValue::HeartRate(bpm)) => Some(*bpm),
            _ => None,
        }
    }

    pub fn body_sensor_location(&self) -> Option<BodySensorLocation> {
        match self.values.get(&CharacteristicKind::BodySensorLocation) {
            Some(CharacteristicValue::BodySensorLocation(location)) => Some(*location),
            _ => None,
        }
    }
}

/// Adapter-level state of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BluetoothState {
    /// The user has not allowed Bluetooth use yet
    Unauthorized,
    /// The adapter is off or still initializing
    Preparing,
    /// Powered on and idle
    Ready,
    Scanning,
    ScanComplete,
}

impl BluetoothState {
    /// True once the adapter is powered on
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Scanning | Self::ScanComplete)
    }
}
