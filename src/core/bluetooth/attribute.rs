//! Attribute catalog
//! Static tables mapping assigned numbers to the services and
//! characteristics this crate understands, plus the caller's list of
//! required services.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    BATTERY_LEVEL, BATTERY_SERVICE, BLUETOOTH_BASE_UUID, BODY_SENSOR_LOCATION,
    HEART_RATE_CONTROL_POINT, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
};
use crate::error::{BluetoothError, Result};

static SHORT_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(?:0x)?([0-9a-f]{4})$").expect("short attribute id pattern is valid")
});

/// A 16-bit GATT assigned number naming a service or characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttributeId(u16);

impl AttributeId {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Expands the assigned number into the Bluetooth base UUID
    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((self.0 as u128) << 96))
    }

    /// Shortens a 128-bit UUID, if it lies on the Bluetooth base UUID
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        let value = uuid.as_u128();
        let short = value >> 96;
        let base_mask = (1u128 << 96) - 1;
        if value & base_mask == BLUETOOTH_BASE_UUID.as_u128() && short <= u16::MAX as u128 {
            Some(Self(short as u16))
        } else {
            None
        }
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for AttributeId {
    type Err = BluetoothError;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if let Some(captures) = SHORT_ID_PATTERN.captures(trimmed) {
            return u16::from_str_radix(&captures[1], 16)
                .map(Self)
                .map_err(|_| BluetoothError::UnknownAttribute(value.to_string()));
        }
        Uuid::parse_str(trimmed)
            .ok()
            .and_then(|uuid| Self::from_uuid(&uuid))
            .ok_or_else(|| BluetoothError::UnknownAttribute(value.to_string()))
    }
}

impl TryFrom<String> for AttributeId {
    type Error = BluetoothError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AttributeId> for String {
    fn from(id: AttributeId) -> Self {
        id.to_string()
    }
}

/// Services known to the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    Battery,
    HeartRate,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 2] = [ServiceKind::Battery, ServiceKind::HeartRate];

    pub const fn id(&self) -> AttributeId {
        match self {
            Self::Battery => AttributeId::new(BATTERY_SERVICE),
            Self::HeartRate => AttributeId::new(HEART_RATE_SERVICE),
        }
    }

    pub fn from_id(id: AttributeId) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    /// The fixed characteristic set of this service, in declaration order
    pub const fn characteristics(&self) -> &'static [CharacteristicKind] {
        match self {
            Self::Battery => &[CharacteristicKind::BatteryLevel],
            Self::HeartRate => &[
                CharacteristicKind::HeartRateMeasurement,
                CharacteristicKind::BodySensorLocation,
                CharacteristicKind::HeartRateControlPoint,
            ],
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Battery => write!(f, "Battery ({})", self.id()),
            Self::HeartRate => write!(f, "Heart Rate ({})", self.id()),
        }
    }
}

/// Characteristics known to the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CharacteristicKind {
    BatteryLevel,
    HeartRateMeasurement,
    BodySensorLocation,
    HeartRateControlPoint,
}

impl CharacteristicKind {
    pub const ALL: [CharacteristicKind; 4] = [
        CharacteristicKind::BatteryLevel,
        CharacteristicKind::HeartRateMeasurement,
        CharacteristicKind::BodySensorLocation,
        CharacteristicKind::HeartRateControlPoint,
    ];

    pub const fn id(&self) -> AttributeId {
        match self {
            Self::BatteryLevel => AttributeId::new(BATTERY_LEVEL),
            Self::HeartRateMeasurement => AttributeId::new(HEART_RATE_MEASUREMENT),
            Self::BodySensorLocation => AttributeId::new(BODY_SENSOR_LOCATION),
            Self::HeartRateControlPoint => AttributeId::new(HEART_RATE_CONTROL_POINT),
        }
    }

    /// The service that owns this characteristic
    pub const fn service(&self) -> ServiceKind {
        match self {
            Self::BatteryLevel => ServiceKind::Battery,
            Self::HeartRateMeasurement
            | Self::BodySensorLocation
            | Self::HeartRateControlPoint => ServiceKind::HeartRate,
        }
    }

    pub fn from_id(id: AttributeId) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }
}

impl fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BatteryLevel => "Battery Level",
            Self::HeartRateMeasurement => "Heart Rate Measurement",
            Self::BodySensorLocation => "Body Sensor Location",
            Self::HeartRateControlPoint => "Heart Rate Control Point",
        };
        write!(f, "{} ({})", name, self.id())
    }
}

/// Either side of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    Service(ServiceKind),
    Characteristic(CharacteristicKind),
}

impl Attribute {
    pub fn from_id(id: AttributeId) -> Option<Self> {
        ServiceKind::from_id(id)
            .map(Attribute::Service)
            .or_else(|| CharacteristicKind::from_id(id).map(Attribute::Characteristic))
    }

    pub fn id(&self) -> AttributeId {
        match self {
            Attribute::Service(kind) => kind.id(),
            Attribute::Characteristic(kind) => kind.id(),
        }
    }
}

/// Resolves a raw identifier string against the catalog
pub fn resolve(raw: &str) -> Result<Attribute> {
    let id: AttributeId = raw.parse()?;
    Attribute::from_id(id).ok_or_else(|| BluetoothError::UnknownAttribute(raw.to_string()))
}

/// A service together with the characteristics of it the caller cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub characteristics: Vec<CharacteristicKind>,
}

impl ServiceDescriptor {
    /// Creates a descriptor, rejecting characteristics owned by another service
    pub fn new(kind: ServiceKind, characteristics: Vec<CharacteristicKind>) -> Result<Self> {
        if let Some(stray) = characteristics.iter().find(|c| c.service() != kind) {
            return Err(BluetoothError::CharacteristicMismatch {
                characteristic: stray.id().to_string(),
                service: kind.id().to_string(),
            });
        }
        Ok(Self {
            kind,
            characteristics,
        })
    }

    /// A descriptor covering every characteristic of the service
    pub fn all(kind: ServiceKind) -> Self {
        Self {
            kind,
            characteristics: kind.characteristics().to_vec(),
        }
    }

    pub fn battery() -> Self {
        Self::all(ServiceKind::Battery)
    }

    pub fn heart_rate() -> Self {
        Self::all(ServiceKind::HeartRate)
    }
}

/// The caller's requirement list
#[derive(Debug, Clone, Default)]
pub struct Registrations {
    services: Vec<ServiceDescriptor>,
}

impl Registrations {
    pub fn require(&mut self, descriptor: ServiceDescriptor) {
        self.services.push(descriptor);
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Registered service ids, first registration first, without duplicates
    pub fn service_ids(&self) -> Vec<AttributeId> {
        let mut ids = Vec::new();
        for service in &self.services {
            let id = service.kind.id();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    pub fn service_kind(&self, id: AttributeId) -> Option<ServiceKind> {
        self.services
            .iter()
            .map(|service| service.kind)
            .find(|kind| kind.id() == id)
    }

    /// Union of every registration of `kind`
    pub fn characteristics_for(&self, kind: ServiceKind) -> Vec<CharacteristicKind> {
        let mut union = Vec::new();
        for service in self.services.iter().filter(|s| s.kind == kind) {
            for characteristic in &service.characteristics {
                if !union.contains(characteristic) {
                    union.push(*characteristic);
                }
            }
        }
        union
    }

    pub fn characteristic_ids(&self) -> BTreeSet<AttributeId> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter().map(|c| c.id()))
            .collect()
    }

    pub fn contains_characteristic(&self, id: AttributeId) -> bool {
        self.services
            .iter()
            .any(|service| service.characteristics.iter().any(|c| c.id() == id))
    }
}
