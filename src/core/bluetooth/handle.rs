//! Public handle to a running orchestrator

use std::sync::Arc;

use log::info;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::attribute::ServiceDescriptor;
use crate::core::bluetooth::cache::{CachedDeviceEntry, DeviceCache};
use crate::core::bluetooth::commands::Adapter;
use crate::core::bluetooth::events::AdapterEvent;
use crate::core::bluetooth::manager::{BluetoothManager, ManagerCommand, ManagerRequest};
use crate::core::bluetooth::registry::{PeripheralStream, RegistryChange, record_stream};
use crate::core::bluetooth::store::KeyValueStore;
use crate::core::bluetooth::types::{BluetoothState, PeripheralId, PeripheralRecord, PollingPolicy};
use crate::error::Result;

/// Cheap to clone. The orchestrator stops once every clone is dropped or
/// `shutdown` is called.
#[derive(Clone)]
pub struct Bluetooth {
    requests: mpsc::Sender<ManagerRequest>,
    state: watch::Receiver<BluetoothState>,
    changes: broadcast::Sender<RegistryChange>,
}

impl Bluetooth {
    /// Spawns the orchestrator task on the current tokio runtime
    pub fn spawn(
        adapter: Arc<dyn Adapter>,
        events: mpsc::Receiver<AdapterEvent>,
        store: Arc<dyn KeyValueStore>,
        config: &BluetoothConfig,
    ) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (requests, requests_rx) = mpsc::channel(capacity);
        let (state_tx, state) = watch::channel(BluetoothState::Preparing);
        let (changes, _) = broadcast::channel(capacity);
        let (timers, timers_rx) = mpsc::unbounded_channel();

        let manager = BluetoothManager::new(
            adapter,
            DeviceCache::new(store),
            config,
            state_tx,
            changes.clone(),
            timers,
        );
        tokio::spawn(manager.run(requests_rx, events, timers_rx));
        info!("Bluetooth orchestrator spawned");

        Self {
            requests,
            state,
            changes,
        }
    }

    /// Registers a service to look for. Fails once `start` has been called.
    pub async fn require_service(&self, descriptor: ServiceDescriptor) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ManagerRequest::RequireService(descriptor, reply))
            .await?;
        response.await?
    }

    pub async fn start(&self) -> Result<()> {
        self.command(ManagerCommand::Start).await
    }

    pub async fn request_authorization(&self) -> Result<()> {
        self.command(ManagerCommand::RequestAuthorization).await
    }

    /// Scans for the registered services for the configured duration
    pub async fn scan(&self) -> Result<()> {
        self.command(ManagerCommand::Scan).await
    }

    pub async fn reconnect_known(&self) -> Result<()> {
        self.command(ManagerCommand::ReconnectKnown).await
    }

    /// Connects to `peripheral`, optionally sampling its RSSI per `polling`
    pub async fn connect(&self, peripheral: PeripheralId, polling: Option<PollingPolicy>) -> Result<()> {
        self.command(ManagerCommand::Connect {
            peripheral,
            polling,
        })
        .await
    }

    pub async fn disconnect(&self, peripheral: PeripheralId, forget: bool) -> Result<()> {
        self.command(ManagerCommand::Disconnect { peripheral, forget })
            .await
    }

    pub async fn forget(&self, peripheral: PeripheralId) -> Result<()> {
        self.command(ManagerCommand::Forget(peripheral)).await
    }

    /// Every record, ordered by identity
    pub async fn snapshot(&self) -> Result<Vec<PeripheralRecord>> {
        let (reply, response) = oneshot::channel();
        self.requests.send(ManagerRequest::Snapshot(reply)).await?;
        Ok(response.await?)
    }

    pub async fn known_devices(&self) -> Result<Vec<CachedDeviceEntry>> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ManagerRequest::KnownDevices(reply))
            .await?;
        Ok(response.await?)
    }

    /// Stops the orchestrator. Later calls fail with `ManagerStopped`.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests.send(ManagerRequest::Shutdown(reply)).await?;
        Ok(response.await?)
    }

    /// Updated records from now on, one item per change
    pub fn peripherals(&self) -> PeripheralStream {
        record_stream(self.changes.subscribe())
    }

    pub fn state(&self) -> BluetoothState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<BluetoothState> {
        self.state.clone()
    }

    /// Returns once the orchestrator has processed `command`. Rejections
    /// (such as the adapter not being ready) are logged, not returned.
    async fn command(&self, command: ManagerCommand) -> Result<()> {
        let (done, processed) = oneshot::channel();
        self.requests
            .send(ManagerRequest::Command(command, done))
            .await?;
        Ok(processed.await?)
    }
}
