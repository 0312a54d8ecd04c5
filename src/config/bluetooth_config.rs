use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_SCAN_DURATION_SECS};
use crate::core::bluetooth::types::PollingPolicy;

const DEVICE_CACHE_FILE_NAME: &str = "known_devices.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// How long a scan runs before it is stopped
    pub scan_duration_secs: u64,

    /// Where the known-device cache lives
    pub cache_path: PathBuf,

    /// RSSI polling applied to peripherals connected by `reconnect_known`
    pub reconnect_polling: Option<PollingPolicy>,

    /// Capacity of the command and change channels
    pub channel_capacity: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            cache_path: PathBuf::from(DEVICE_CACHE_FILE_NAME),
            reconnect_polling: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl BluetoothConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}
