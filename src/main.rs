//! gatt-monitor
//! Connects to known heart rate straps and battery-powered peripherals, scans
//! for new ones and prints every record update.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use gatt_peripherals::config::{AppConfig, CONFIG_FILE_NAME};
use gatt_peripherals::core::bluetooth::{
    Bluetooth, BluetoothState, BluestAdapter, JsonFileStore, KeyValueStore, MemoryStore,
    PeripheralStatus, ServiceDescriptor,
};
use gatt_peripherals::logging;
use log::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = AppConfig::load_config(&config_path).await?;
    logging::init(config.logging.level_filter());

    let (events_tx, events_rx) = tokio::sync::mpsc::channel(config.bluetooth.channel_capacity.max(1));
    let adapter = BluestAdapter::new(events_tx).await?;
    let store: Arc<dyn KeyValueStore> = match JsonFileStore::open(&config.bluetooth.cache_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!("Device cache unreadable, known devices will not be remembered: {}", e);
            Arc::new(MemoryStore::new())
        }
    };
    let bluetooth = Bluetooth::spawn(Arc::new(adapter), events_rx, store, &config.bluetooth);

    bluetooth.require_service(ServiceDescriptor::battery()).await?;
    bluetooth.require_service(ServiceDescriptor::heart_rate()).await?;
    bluetooth.start().await?;

    let mut state = bluetooth.state_changes();
    state.wait_for(BluetoothState::is_ready).await?;
    info!("Bluetooth ready, reconnecting known devices and scanning");

    let mut updates = bluetooth.peripherals();
    bluetooth.reconnect_known().await?;
    bluetooth.scan().await?;

    let mut attempted = HashSet::new();
    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(record) = update else { break };
                let values: Vec<String> = record.values.values().map(|v| v.to_string()).collect();
                println!(
                    "{} {:<20} {:?} rssi={:?} {}",
                    record.id,
                    record.display_name(),
                    record.status(),
                    record.rssi,
                    values.join(", ")
                );
                if record.status() == PeripheralStatus::Available && attempted.insert(record.id.clone()) {
                    bluetooth.connect(record.id.clone(), config.bluetooth.reconnect_polling).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                break;
            }
        }
    }

    bluetooth.shutdown().await?;
    Ok(())
}
