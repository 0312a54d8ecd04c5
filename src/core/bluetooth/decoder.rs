//! Characteristic payload decoding
//! Turns raw characteristic bytes into typed values. Pure functions only.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::bluetooth::attribute::CharacteristicKind;

/// Flag bit in the first heart rate measurement byte selecting a 16-bit value
const HEART_RATE_VALUE_FORMAT_16BIT: u8 = 0x01;

/// Why a payload could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("value {0} is out of range")]
    OutOfRange(u8),

    /// The characteristic has no decoder; reaching this is a registration bug
    #[error("no decoder for characteristic {0}")]
    Unsupported(CharacteristicKind),
}

/// Where a heart rate sensor is worn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodySensorLocation {
    Other = 0,
    Chest = 1,
    Wrist = 2,
    Finger = 3,
    Hand = 4,
    EarLobe = 5,
    Foot = 6,
}

impl BodySensorLocation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Other => "other",
            Self::Chest => "chest",
            Self::Wrist => "wrist",
            Self::Finger => "finger",
            Self::Hand => "hand",
            Self::EarLobe => "ear lobe",
            Self::Foot => "foot",
        }
    }
}

impl TryFrom<u8> for BodySensorLocation {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Other),
            1 => Ok(Self::Chest),
            2 => Ok(Self::Wrist),
            3 => Ok(Self::Finger),
            4 => Ok(Self::Hand),
            5 => Ok(Self::EarLobe),
            6 => Ok(Self::Foot),
            other => Err(DecodeError::OutOfRange(other)),
        }
    }
}

/// A decoded characteristic value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacteristicValue {
    /// Battery level in percent. Not clamped to 0-100.
    BatteryLevel(u8),
    /// Heart rate in beats per minute
    HeartRate(u16),
    BodySensorLocation(BodySensorLocation),
}

impl CharacteristicValue {
    /// The characteristic this value was read from
    pub fn kind(&self) -> CharacteristicKind {
        match self {
            Self::BatteryLevel(_) => CharacteristicKind::BatteryLevel,
            Self::HeartRate(_) => CharacteristicKind::HeartRateMeasurement,
            Self::BodySensorLocation(_) => CharacteristicKind::BodySensorLocation,
        }
    }
}

impl fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatteryLevel(level) => write!(f, "Battery Level: {}%", level),
            Self::HeartRate(bpm) => write!(f, "Heart Rate: {} bpm", bpm),
            Self::BodySensorLocation(location) => {
                write!(f, "Body sensor location: {}", location.name())
            }
        }
    }
}

/// Decodes `bytes` received for the characteristic `kind`
pub fn decode(kind: CharacteristicKind, bytes: &[u8]) -> Result<CharacteristicValue, DecodeError> {
    match kind {
        CharacteristicKind::BatteryLevel => decode_battery_level(bytes),
        CharacteristicKind::HeartRateMeasurement => decode_heart_rate(bytes),
        CharacteristicKind::BodySensorLocation => decode_body_sensor_location(bytes),
        CharacteristicKind::HeartRateControlPoint => Err(DecodeError::Unsupported(kind)),
    }
}

fn decode_battery_level(bytes: &[u8]) -> Result<CharacteristicValue, DecodeError> {
    let level = *bytes.first().ok_or(DecodeError::Empty)?;
    Ok(CharacteristicValue::BatteryLevel(level))
}

/// Bit 0 of the flags byte selects the value format:
/// 0 means the bpm is the 8-bit byte[1],
/// 1 means the bpm is byte[1] shifted left 8 plus byte[2].
fn decode_heart_rate(bytes: &[u8]) -> Result<CharacteristicValue, DecodeError> {
    let flags = *bytes.first().ok_or(DecodeError::Empty)?;
    let wide = flags & HEART_RATE_VALUE_FORMAT_16BIT != 0;
    let expected = if wide { 3 } else { 2 };
    if bytes.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    let bpm = if wide {
        ((bytes[1] as u16) << 8) + bytes[2] as u16
    } else {
        bytes[1] as u16
    };
    Ok(CharacteristicValue::HeartRate(bpm))
}

fn decode_body_sensor_location(bytes: &[u8]) -> Result<CharacteristicValue, DecodeError> {
    let raw = *bytes.first().ok_or(DecodeError::Empty)?;
    BodySensorLocation::try_from(raw).map(CharacteristicValue::BodySensorLocation)
}
