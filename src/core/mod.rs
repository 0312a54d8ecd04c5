//! Core functionality
//! Everything that talks to peripherals lives under `bluetooth`.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{Bluetooth, PeripheralId, PeripheralRecord, ServiceDescriptor};
