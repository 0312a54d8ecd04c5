//! GATT peripheral management
//! Scans for, connects to and remembers Bluetooth LE peripherals exposing the
//! battery and heart rate services, and decodes their characteristic values.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use crate::core::bluetooth::Bluetooth;
pub use crate::error::{BluetoothError, Result};
