//! Constants used throughout the crate
//! This module contains assigned numbers, timeouts, signal thresholds and
//! the keys used by the device cache.

use uuid::Uuid;

/// Display name used when a peripheral does not advertise one
pub const UNNAMED_DEVICE: &str = "Unnamed Device";

/// Standard Bluetooth Service assigned numbers
pub const BATTERY_SERVICE: u16 = 0x180F;
pub const HEART_RATE_SERVICE: u16 = 0x180D;

/// Standard Bluetooth Characteristic assigned numbers
pub const BATTERY_LEVEL: u16 = 0x2A19;
pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
pub const BODY_SENSOR_LOCATION: u16 = 0x2A38;
pub const HEART_RATE_CONTROL_POINT: u16 = 0x2A39;

/// The Bluetooth base UUID that 16-bit assigned numbers are expanded into
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 5;

/// Capacity of the command, event and subscriber channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// RSSI lower bounds (inclusive) for each signal strength bucket
pub const RSSI_EXCELLENT_THRESHOLD: i16 = -50;
pub const RSSI_GOOD_THRESHOLD: i16 = -60;
pub const RSSI_FAIR_THRESHOLD: i16 = -70;

/// Device cache key holding the ordered list of known identities
pub const KNOWN_IDENTIFIERS_KEY: &str = "peripheral.identifiers.list";
