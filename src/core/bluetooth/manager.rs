//! Peripheral orchestrator
//! A single task owns the registry, the device cache handle and every timer.
//! User requests, adapter events and timer ticks are consumed by one loop,
//! so no two paths ever mutate the same record concurrently.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::attribute::{AttributeId, Registrations, ServiceDescriptor};
use crate::core::bluetooth::cache::{CachedDeviceEntry, DeviceCache};
use crate::core::bluetooth::commands::{Adapter, AdapterCommand, Authorization};
use crate::core::bluetooth::connection::{ConnectionManager, merge_confirmed};
use crate::core::bluetooth::events::{
    AdapterEvent, DiscoveredCharacteristic, HardwareState, RetrievedPeripheral, TimerEvent,
};
use crate::core::bluetooth::notification::{report_invariant_breach, route_value};
use crate::core::bluetooth::polling::RssiPoller;
use crate::core::bluetooth::registry::{PeripheralRegistry, RegistryChange};
use crate::core::bluetooth::scanner::ScanTimer;
use crate::core::bluetooth::types::{
    BluetoothState, ConnectionState, PeripheralId, PeripheralRecord, PollingPolicy,
};
use crate::error::{BluetoothError, Result};

/// Operations a caller can ask of the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCommand {
    Start,
    RequestAuthorization,
    Scan,
    ReconnectKnown,
    Connect {
        peripheral: PeripheralId,
        polling: Option<PollingPolicy>,
    },
    Disconnect {
        peripheral: PeripheralId,
        forget: bool,
    },
    Forget(PeripheralId),
}

/// A command or query together with the channel its answer goes back on
pub(crate) enum ManagerRequest {
    Command(ManagerCommand, oneshot::Sender<()>),
    RequireService(ServiceDescriptor, oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<Vec<PeripheralRecord>>),
    KnownDevices(oneshot::Sender<Vec<CachedDeviceEntry>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct BluetoothManager {
    state: watch::Sender<BluetoothState>,
    registrations: Registrations,
    started: bool,
    registry: PeripheralRegistry,
    cache: DeviceCache,
    connection: ConnectionManager,
    scanner: ScanTimer,
    poller: RssiPoller,
    reconnect_polling: Option<PollingPolicy>,
}

impl BluetoothManager {
    pub(crate) fn new(
        adapter: Arc<dyn Adapter>,
        cache: DeviceCache,
        config: &BluetoothConfig,
        state: watch::Sender<BluetoothState>,
        changes: broadcast::Sender<RegistryChange>,
        timers: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        let initial = match adapter.authorization() {
            Authorization::Allowed => BluetoothState::Preparing,
            Authorization::NotDetermined | Authorization::Denied => BluetoothState::Unauthorized,
        };
        state.send_replace(initial);

        Self {
            state,
            registrations: Registrations::default(),
            started: false,
            registry: PeripheralRegistry::new(changes),
            cache,
            connection: ConnectionManager::new(adapter),
            scanner: ScanTimer::new(config.scan_duration(), timers.clone()),
            poller: RssiPoller::new(timers),
            reconnect_polling: config.reconnect_polling,
        }
    }

    pub fn state(&self) -> BluetoothState {
        *self.state.borrow()
    }

    pub fn registry(&self) -> &PeripheralRegistry {
        &self.registry
    }

    /// Runs until shutdown is requested or every handle is dropped
    pub(crate) async fn run(
        mut self,
        mut requests: mpsc::Receiver<ManagerRequest>,
        mut events: mpsc::Receiver<AdapterEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        info!("Bluetooth manager running");
        loop {
            tokio::select! {
                // events first, so a query never overtakes an event that was already delivered
                biased;
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(tick) = timers.recv() => self.handle_timer(tick).await,
                request = requests.recv() => match request {
                    Some(ManagerRequest::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        info!("Bluetooth manager stopped");
    }

    async fn handle_request(&mut self, request: ManagerRequest) {
        match request {
            ManagerRequest::Command(command, done) => {
                if let Err(e) = self.handle_command(command).await {
                    warn!("{}", e);
                }
                let _ = done.send(());
            }
            ManagerRequest::RequireService(descriptor, reply) => {
                let _ = reply.send(self.require_service(descriptor));
            }
            ManagerRequest::Snapshot(reply) => {
                let _ = reply.send(self.registry.all());
            }
            ManagerRequest::KnownDevices(reply) => {
                let _ = reply.send(self.known_devices().await);
            }
            ManagerRequest::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    pub async fn handle_command(&mut self, command: ManagerCommand) -> Result<()> {
        match command {
            ManagerCommand::Start => self.start().await,
            ManagerCommand::RequestAuthorization => self.request_authorization().await,
            ManagerCommand::Scan => self.scan().await,
            ManagerCommand::ReconnectKnown => self.reconnect_known().await,
            ManagerCommand::Connect {
                peripheral,
                polling,
            } => self.connect(&peripheral, polling).await,
            ManagerCommand::Disconnect { peripheral, forget } => {
                self.disconnect(&peripheral, forget).await
            }
            ManagerCommand::Forget(peripheral) => self.forget(&peripheral).await,
        }
    }

    /// Adds a service requirement. Only allowed before `start`.
    pub fn require_service(&mut self, descriptor: ServiceDescriptor) -> Result<()> {
        if self.started {
            return Err(BluetoothError::RegistrationClosed);
        }
        info!("Registered service {}", descriptor.kind);
        self.registrations.require(descriptor);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        if self.started {
            debug!("Bluetooth manager already started");
            return Ok(());
        }
        self.started = true;
        info!(
            "Starting with services {:?}",
            self.registrations.service_ids()
        );
        self.connection.send(AdapterCommand::Activate).await;
        Ok(())
    }

    async fn request_authorization(&mut self) -> Result<()> {
        info!("Requesting Bluetooth authorization");
        self.connection.send(AdapterCommand::Activate).await;
        Ok(())
    }

    async fn scan(&mut self) -> Result<()> {
        self.ensure_ready("scan")?;
        let services = self.registrations.service_ids();
        if self.connection.send(AdapterCommand::StartScan { services }).await {
            self.set_state(BluetoothState::Scanning);
            self.scanner.start();
        }
        Ok(())
    }

    async fn reconnect_known(&mut self) -> Result<()> {
        self.ensure_ready("reconnect")?;

        let known = self.cache.list_known_identities().await;
        if !known.is_empty() {
            info!("Reconnecting {} known peripherals", known.len());
            self.connection
                .send(AdapterCommand::RetrievePeripherals(known))
                .await;
            return Ok(());
        }

        let services = self.registrations.service_ids();
        if !services.is_empty() {
            info!("Reconnecting peripherals connected with {:?}", services);
            self.connection
                .send(AdapterCommand::RetrieveConnectedPeripherals(services))
                .await;
            return Ok(());
        }

        debug!("No known peripherals and no registered services, nothing to reconnect");
        Ok(())
    }

    /// Connects a peripheral the adapter has already reported. Unknown
    /// identities are ignored.
    async fn connect(&mut self, id: &PeripheralId, polling: Option<PollingPolicy>) -> Result<()> {
        self.ensure_ready("connect")?;

        let Some(state) = self.registry.get(id).map(|record| record.connection_state) else {
            warn!("Cannot connect to {}: peripheral was never discovered", id);
            return Ok(());
        };
        if state == ConnectionState::Connected {
            info!("{} already connected.", id);
            self.registry.update(id, |record| record.polling = polling);
            self.apply_polling(id, polling);
            return Ok(());
        }

        self.registry.update(id, |record| {
            record.connection_state = ConnectionState::Connecting;
            record.polling = polling;
        });
        if !self.connection.connect(id).await {
            self.registry.update(id, |record| {
                record.connection_state = ConnectionState::Disconnected;
            });
        }
        Ok(())
    }

    /// Disconnects a connected or connecting peripheral. Anything else is a
    /// no-op, including the forget.
    async fn disconnect(&mut self, id: &PeripheralId, forget: bool) -> Result<()> {
        self.ensure_ready("disconnect")?;
        match self.registry.get(id).map(|record| record.connection_state) {
            Some(ConnectionState::Connected | ConnectionState::Connecting) => {}
            Some(ConnectionState::Disconnected) => {
                debug!("{} is not connected, nothing to disconnect", id);
                return Ok(());
            }
            None => {
                warn!("Cannot disconnect {}: unknown peripheral", id);
                return Ok(());
            }
        }
        self.poller.cancel(id);
        if forget {
            self.forget_device(id).await;
        }
        self.connection.disconnect(id).await;
        Ok(())
    }

    async fn forget(&mut self, id: &PeripheralId) -> Result<()> {
        self.ensure_ready("forget")?;
        self.forget_device(id).await;
        Ok(())
    }

    async fn forget_device(&mut self, id: &PeripheralId) {
        self.cache.forget(id).await;
        self.registry.update(id, |record| record.is_known = false);
    }

    /// Every known device with its cached details
    pub async fn known_devices(&self) -> Vec<CachedDeviceEntry> {
        let mut entries = Vec::new();
        for id in self.cache.list_known_identities().await {
            if let Some(entry) = self.cache.details(&id).await {
                entries.push(entry);
            }
        }
        entries
    }

    /// Stops timers and drops every record
    pub async fn shutdown(&mut self) {
        info!("Shutting down Bluetooth manager");
        if self.scanner.is_active() {
            self.scanner.cancel();
            self.connection.send(AdapterCommand::StopScan).await;
        }
        self.poller.cancel_all();
        self.registry.clear();
    }

    pub async fn handle_event(&mut self, event: AdapterEvent) {
        debug!("Adapter event: {:?}", event);
        match event {
            AdapterEvent::HardwareStateChanged(hardware) => self.on_hardware_state(hardware),
            AdapterEvent::PeripheralDiscovered {
                peripheral,
                name,
                rssi,
                advertised_services,
            } => {
                self.on_discovered(&peripheral, name, rssi, &advertised_services)
                    .await
            }
            AdapterEvent::PeripheralConnected { peripheral, name } => {
                self.on_connected(&peripheral, name).await
            }
            AdapterEvent::ConnectionFailed { peripheral, error } => {
                warn!("Failed to connect to {}: {}", peripheral, error);
                self.poller.cancel(&peripheral);
                self.registry.update(&peripheral, |record| {
                    record.connection_state = ConnectionState::Disconnected;
                });
            }
            AdapterEvent::PeripheralDisconnected { peripheral, error } => {
                match error {
                    Some(error) => warn!("{} disconnected: {}", peripheral, error),
                    None => info!("{} disconnected", peripheral),
                }
                self.poller.cancel(&peripheral);
                self.registry.update(&peripheral, |record| {
                    record.connection_state = ConnectionState::Disconnected;
                    record.polling = None;
                });
            }
            AdapterEvent::ServicesDiscovered {
                peripheral,
                services,
            } => match services {
                Ok(services) => self.on_services_discovered(&peripheral, &services).await,
                Err(e) => warn!("Service discovery failed on {}: {}", peripheral, e),
            },
            AdapterEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
            } => match characteristics {
                Ok(characteristics) => {
                    self.on_characteristics_discovered(&peripheral, service, &characteristics)
                        .await
                }
                Err(e) => warn!(
                    "Characteristic discovery failed on {} for service {}: {}",
                    peripheral, service, e
                ),
            },
            AdapterEvent::CharacteristicValueUpdated {
                peripheral,
                characteristic,
                value,
            } => match value {
                Ok(bytes) => self.on_value(&peripheral, characteristic, &bytes),
                Err(e) => warn!(
                    "Reading characteristic {} on {} failed: {}",
                    characteristic, peripheral, e
                ),
            },
            AdapterEvent::RssiRead { peripheral, rssi } => match rssi {
                Ok(rssi) => {
                    if self
                        .registry
                        .update(&peripheral, |record| record.set_rssi(rssi))
                        .is_none()
                    {
                        debug!("RSSI for unknown peripheral {}", peripheral);
                    }
                }
                Err(e) => warn!("Reading RSSI of {} failed: {}", peripheral, e),
            },
            AdapterEvent::PeripheralsRetrieved(peripherals) => {
                self.on_retrieved(peripherals).await
            }
        }
    }

    pub(crate) async fn handle_timer(&mut self, tick: TimerEvent) {
        match tick {
            TimerEvent::ScanTimeout { generation } => {
                if !self.scanner.finish(generation) {
                    debug!("Ignoring stale scan timeout {}", generation);
                    return;
                }
                info!("Scan finished");
                self.connection.send(AdapterCommand::StopScan).await;
                if self.state() == BluetoothState::Scanning {
                    self.set_state(BluetoothState::ScanComplete);
                }
            }
            TimerEvent::PollTick {
                peripheral,
                generation,
            } => {
                if self.poller.accepts(&peripheral, generation) {
                    self.connection
                        .send(AdapterCommand::ReadRssi(peripheral))
                        .await;
                }
            }
            TimerEvent::PollExpired {
                peripheral,
                generation,
            } => {
                if self.poller.expire(&peripheral, generation) {
                    self.registry.update(&peripheral, |record| record.polling = None);
                }
            }
        }
    }

    fn on_hardware_state(&mut self, hardware: HardwareState) {
        match hardware {
            HardwareState::PoweredOn => {
                if !self.state().is_ready() {
                    self.set_state(BluetoothState::Ready);
                }
            }
            HardwareState::PoweredOff => {
                self.scanner.cancel();
                self.set_state(BluetoothState::Preparing);
            }
            HardwareState::Unauthorized => {
                self.scanner.cancel();
                self.set_state(BluetoothState::Unauthorized);
            }
            other => debug!("Ignoring hardware state {:?}", other),
        }
    }

    async fn on_discovered(
        &mut self,
        id: &PeripheralId,
        name: Option<String>,
        rssi: Option<i16>,
        advertised_services: &[AttributeId],
    ) {
        let is_known = self.cache.is_known(id).await;
        let record = self.registry.upsert(id, |record| {
            if name.is_some() {
                record.name = name;
            }
            record.is_known = is_known;
            if let Some(rssi) = rssi {
                record.set_rssi(rssi);
            }
        });
        debug!(
            "Discovered {} ({}) rssi {:?} advertising {:?}",
            record.id,
            record.display_name(),
            record.rssi,
            advertised_services
        );
    }

    async fn on_connected(&mut self, id: &PeripheralId, name: Option<String>) {
        self.cache.remember(id).await;
        let record = self.registry.upsert(id, |record| {
            record.connection_state = ConnectionState::Connected;
            record.is_known = true;
            if name.is_some() {
                record.name = name;
            }
        });
        info!("Connected to {} ({})", id, record.display_name());

        if let Some(policy) = record.polling {
            self.poller.start(id, policy);
        }
        self.connection.send(AdapterCommand::ReadRssi(id.clone())).await;
        self.connection
            .discover_services(id, &self.registrations)
            .await;
    }

    async fn on_services_discovered(&mut self, id: &PeripheralId, services: &[AttributeId]) {
        let confirmed = self
            .connection
            .on_services_discovered(id, services, &self.registrations)
            .await;
        let record = self.registry.update(id, |record| {
            let services = record.services.get_or_insert_with(Vec::new);
            for kind in confirmed {
                if !services.iter().any(|s| s.kind == kind) {
                    services.push(ServiceDescriptor {
                        kind,
                        characteristics: Vec::new(),
                    });
                }
            }
        });
        self.persist_services(id, record).await;
    }

    async fn on_characteristics_discovered(
        &mut self,
        id: &PeripheralId,
        service: AttributeId,
        characteristics: &[DiscoveredCharacteristic],
    ) {
        let Some(kind) = self.registrations.service_kind(service) else {
            debug!("Characteristics of unregistered service {} on {}", service, id);
            return;
        };
        let confirmed = self
            .connection
            .on_characteristics_discovered(id, service, characteristics, &self.registrations)
            .await;
        let record = self.registry.update(id, |record| {
            merge_confirmed(record.services.get_or_insert_with(Vec::new), kind, confirmed);
        });
        self.persist_services(id, record).await;
    }

    async fn persist_services(&self, id: &PeripheralId, record: Option<PeripheralRecord>) {
        match record.and_then(|record| record.services) {
            Some(services) => self.cache.record_services(id, &services).await,
            None => debug!("Discovery result for unknown peripheral {}", id),
        }
    }

    fn on_value(&mut self, id: &PeripheralId, characteristic: AttributeId, bytes: &[u8]) {
        match route_value(&self.registrations, characteristic, bytes) {
            Ok(Some(value)) => {
                debug!("{}: {}", id, value);
                if self
                    .registry
                    .update(id, |record| record.set_value(value))
                    .is_none()
                {
                    debug!("Value for unknown peripheral {}", id);
                }
            }
            Ok(None) => {}
            Err(e) if !e.is_recoverable() => report_invariant_breach(&e),
            Err(e) => warn!(
                "Dropping value of {} from {}: {}",
                characteristic, id, e
            ),
        }
    }

    async fn on_retrieved(&mut self, peripherals: Vec<RetrievedPeripheral>) {
        for peripheral in peripherals {
            info!(
                "Retrieved {} ({:?})",
                peripheral.id, peripheral.state
            );
            let is_known = self.cache.is_known(&peripheral.id).await;
            self.registry.upsert(&peripheral.id, |record| {
                if peripheral.name.is_some() {
                    record.name = peripheral.name.clone();
                }
                record.is_known = is_known;
                record.connection_state = peripheral.state;
            });

            // already connected at the system level: no connect round trip
            if peripheral.state == ConnectionState::Connected {
                let polling = self.reconnect_polling;
                self.registry
                    .update(&peripheral.id, |record| record.polling = polling);
                self.on_connected(&peripheral.id, peripheral.name).await;
                continue;
            }
            if let Err(e) = self.connect(&peripheral.id, self.reconnect_polling).await {
                warn!("Reconnecting {} failed: {}", peripheral.id, e);
            }
        }
    }

    fn apply_polling(&mut self, id: &PeripheralId, polling: Option<PollingPolicy>) {
        match polling {
            Some(policy) => self.poller.start(id, policy),
            None => {
                self.poller.cancel(id);
            }
        }
    }

    fn ensure_ready(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            error!(
                "API misuse: {} requested while Bluetooth is {:?}",
                operation, state
            );
            Err(BluetoothError::AdapterNotReady)
        }
    }

    fn set_state(&mut self, state: BluetoothState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Bluetooth state {:?} -> {:?}", previous, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::attribute::{CharacteristicKind, ServiceKind};
    use crate::core::bluetooth::decoder::{BodySensorLocation, CharacteristicValue};
    use crate::core::bluetooth::events::CharacteristicProperties;
    use crate::core::bluetooth::fake::FakeAdapter;
    use crate::core::bluetooth::store::MemoryStore;
    use crate::core::bluetooth::types::{PeripheralStatus, SignalStrength};
    use std::time::Duration;
    use tokio::time::sleep;

    struct Harness {
        manager: BluetoothManager,
        adapter: FakeAdapter,
        cache: DeviceCache,
        timers: mpsc::UnboundedReceiver<TimerEvent>,
        _changes: broadcast::Receiver<RegistryChange>,
        _events: mpsc::Receiver<AdapterEvent>,
    }

    impl Harness {
        fn new(adapter: FakeAdapter, events: mpsc::Receiver<AdapterEvent>) -> Self {
            Self::with_config(adapter, events, BluetoothConfig::default())
        }

        fn with_config(
            adapter: FakeAdapter,
            events: mpsc::Receiver<AdapterEvent>,
            config: BluetoothConfig,
        ) -> Self {
            let cache = DeviceCache::new(Arc::new(MemoryStore::new()));
            let (state, _) = watch::channel(BluetoothState::Preparing);
            let (changes, changes_rx) = broadcast::channel(64);
            let (timers_tx, timers) = mpsc::unbounded_channel();
            let manager = BluetoothManager::new(
                Arc::new(adapter.clone()),
                cache.clone(),
                &config,
                state,
                changes,
                timers_tx,
            );
            Self {
                manager,
                adapter,
                cache,
                timers,
                _changes: changes_rx,
                _events: events,
            }
        }

        /// Battery and heart rate registered, started and powered on
        async fn ready() -> Self {
            let (adapter, events) = FakeAdapter::channel(16);
            Self::ready_with(adapter, events, BluetoothConfig::default()).await
        }

        async fn ready_with(
            adapter: FakeAdapter,
            events: mpsc::Receiver<AdapterEvent>,
            config: BluetoothConfig,
        ) -> Self {
            let mut harness = Self::with_config(adapter, events, config);
            harness
                .manager
                .require_service(ServiceDescriptor::battery())
                .unwrap();
            harness
                .manager
                .require_service(ServiceDescriptor::heart_rate())
                .unwrap();
            harness.command(ManagerCommand::Start).await.unwrap();
            harness.power_on().await;
            harness.adapter.take_commands();
            harness
        }

        async fn command(&mut self, command: ManagerCommand) -> Result<()> {
            self.manager.handle_command(command).await
        }

        async fn event(&mut self, event: AdapterEvent) {
            self.manager.handle_event(event).await
        }

        async fn power_on(&mut self) {
            self.event(AdapterEvent::HardwareStateChanged(HardwareState::PoweredOn))
                .await;
        }

        async fn connected(&mut self, id: &PeripheralId) {
            self.event(AdapterEvent::PeripheralConnected {
                peripheral: id.clone(),
                name: None,
            })
            .await;
        }

        fn record(&self, id: &PeripheralId) -> PeripheralRecord {
            self.manager.registry().get(id).cloned().unwrap()
        }

        /// Feeds every pending timer tick back into the manager
        async fn pump_timers(&mut self) {
            while let Ok(tick) = self.timers.try_recv() {
                self.manager.handle_timer(tick).await;
            }
        }
    }

    fn connect(id: &PeripheralId, polling: Option<PollingPolicy>) -> ManagerCommand {
        ManagerCommand::Connect {
            peripheral: id.clone(),
            polling,
        }
    }

    fn discovered(id: &PeripheralId, rssi: i16) -> AdapterEvent {
        AdapterEvent::PeripheralDiscovered {
            peripheral: id.clone(),
            name: Some("Polar H10".to_string()),
            rssi: Some(rssi),
            advertised_services: vec![AttributeId::new(0x180D)],
        }
    }

    #[tokio::test]
    async fn test_initial_state_follows_authorization() {
        let (adapter, events) = FakeAdapter::channel(4);
        let harness = Harness::new(adapter, events);
        assert_eq!(harness.manager.state(), BluetoothState::Preparing);

        let (adapter, events) = FakeAdapter::channel(4);
        let harness = Harness::new(adapter.with_authorization(Authorization::Denied), events);
        assert_eq!(harness.manager.state(), BluetoothState::Unauthorized);
    }

    #[tokio::test]
    async fn test_commands_before_ready_are_rejected() {
        let (adapter, events) = FakeAdapter::channel(4);
        let mut harness = Harness::new(adapter, events);
        let id = PeripheralId::new("D1");

        for command in [
            ManagerCommand::Scan,
            ManagerCommand::ReconnectKnown,
            connect(&id, None),
            ManagerCommand::Disconnect {
                peripheral: id.clone(),
                forget: true,
            },
            ManagerCommand::Forget(id.clone()),
        ] {
            let result = harness.command(command).await;
            assert!(matches!(result, Err(BluetoothError::AdapterNotReady)));
        }
        assert!(harness.adapter.commands().is_empty());
        assert!(harness.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_registration_closes_on_start() {
        let (adapter, events) = FakeAdapter::channel(4);
        let mut harness = Harness::new(adapter, events);
        harness
            .manager
            .require_service(ServiceDescriptor::battery())
            .unwrap();
        harness.command(ManagerCommand::Start).await.unwrap();
        harness.command(ManagerCommand::Start).await.unwrap();

        let result = harness.manager.require_service(ServiceDescriptor::heart_rate());
        assert!(matches!(result, Err(BluetoothError::RegistrationClosed)));
        assert_eq!(harness.adapter.count(&AdapterCommand::Activate), 1);
    }

    #[tokio::test]
    async fn test_hardware_state_transitions() {
        let mut harness = Harness::ready().await;
        assert_eq!(harness.manager.state(), BluetoothState::Ready);

        harness.command(ManagerCommand::Scan).await.unwrap();
        harness.power_on().await;
        assert_eq!(harness.manager.state(), BluetoothState::Scanning);

        harness
            .event(AdapterEvent::HardwareStateChanged(HardwareState::Resetting))
            .await;
        assert_eq!(harness.manager.state(), BluetoothState::Scanning);

        harness
            .event(AdapterEvent::HardwareStateChanged(HardwareState::PoweredOff))
            .await;
        assert_eq!(harness.manager.state(), BluetoothState::Preparing);

        harness
            .event(AdapterEvent::HardwareStateChanged(HardwareState::Unauthorized))
            .await;
        assert_eq!(harness.manager.state(), BluetoothState::Unauthorized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_times_out() {
        let mut harness = Harness::ready().await;
        harness.command(ManagerCommand::Scan).await.unwrap();
        assert_eq!(harness.manager.state(), BluetoothState::Scanning);
        assert_eq!(
            harness.adapter.take_commands(),
            vec![AdapterCommand::StartScan {
                services: vec![AttributeId::new(0x180F), AttributeId::new(0x180D)],
            }]
        );

        sleep(Duration::from_secs(4)).await;
        harness.pump_timers().await;
        assert_eq!(harness.manager.state(), BluetoothState::Scanning);

        sleep(Duration::from_secs(2)).await;
        harness.pump_timers().await;
        assert_eq!(harness.manager.state(), BluetoothState::ScanComplete);
        assert_eq!(harness.adapter.take_commands(), vec![AdapterCommand::StopScan]);

        // a stale tick does nothing
        harness
            .manager
            .handle_timer(TimerEvent::ScanTimeout { generation: 1 })
            .await;
        assert!(harness.adapter.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_loss_cancels_scan_timer() {
        let mut harness = Harness::ready().await;
        harness.command(ManagerCommand::Scan).await.unwrap();
        harness
            .event(AdapterEvent::HardwareStateChanged(HardwareState::PoweredOff))
            .await;

        sleep(Duration::from_secs(10)).await;
        harness.pump_timers().await;
        assert_eq!(harness.manager.state(), BluetoothState::Preparing);
        assert_eq!(harness.adapter.count(&AdapterCommand::StopScan), 0);
    }

    #[tokio::test]
    async fn test_discovery_merges_into_one_record() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");

        harness.event(discovered(&id, -80)).await;
        assert_eq!(harness.record(&id).signal_strength, Some(SignalStrength::Weak));
        assert!(!harness.record(&id).is_known);

        harness.cache.remember(&id).await;
        harness.event(discovered(&id, -45)).await;

        assert_eq!(harness.manager.registry().len(), 1);
        let record = harness.record(&id);
        assert_eq!(record.rssi, Some(-45));
        assert_eq!(record.signal_strength, Some(SignalStrength::Excellent));
        assert!(record.is_known);
        assert_eq!(record.status(), PeripheralStatus::Known);
        assert_eq!(record.display_name(), "Polar H10");
    }

    #[tokio::test]
    async fn test_discovery_without_rssi_keeps_previous_sample() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -62)).await;
        harness
            .event(AdapterEvent::PeripheralDiscovered {
                peripheral: id.clone(),
                name: None,
                rssi: None,
                advertised_services: vec![],
            })
            .await;

        let record = harness.record(&id);
        assert_eq!(record.rssi, Some(-62));
        assert_eq!(record.name.as_deref(), Some("Polar H10"));
    }

    #[tokio::test]
    async fn test_reconnect_prefers_known_identities() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.cache.remember(&id).await;

        harness.command(ManagerCommand::ReconnectKnown).await.unwrap();
        assert_eq!(
            harness.adapter.commands(),
            vec![AdapterCommand::RetrievePeripherals(vec![id])]
        );
    }

    #[tokio::test]
    async fn test_reconnect_falls_back_to_service_filter() {
        let mut harness = Harness::ready().await;
        harness.command(ManagerCommand::ReconnectKnown).await.unwrap();
        assert_eq!(
            harness.adapter.commands(),
            vec![AdapterCommand::RetrieveConnectedPeripherals(vec![
                AttributeId::new(0x180F),
                AttributeId::new(0x180D)
            ])]
        );
    }

    #[tokio::test]
    async fn test_reconnect_with_nothing_is_a_no_op() {
        let (adapter, events) = FakeAdapter::channel(4);
        let mut harness = Harness::new(adapter, events);
        harness.command(ManagerCommand::Start).await.unwrap();
        harness.power_on().await;
        harness.adapter.take_commands();

        harness.command(ManagerCommand::ReconnectKnown).await.unwrap();
        assert!(harness.adapter.commands().is_empty());
    }

    #[tokio::test]
    async fn test_connect_lifecycle() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -45)).await;

        harness.command(connect(&id, None)).await.unwrap();
        assert_eq!(harness.record(&id).connection_state, ConnectionState::Connecting);
        assert_eq!(
            harness.adapter.take_commands(),
            vec![AdapterCommand::Connect(id.clone())]
        );

        harness.connected(&id).await;
        let record = harness.record(&id);
        assert_eq!(record.status(), PeripheralStatus::Connected);
        assert!(record.is_known);
        assert!(harness.cache.is_known(&id).await);
        assert_eq!(
            harness.adapter.take_commands(),
            vec![
                AdapterCommand::ReadRssi(id.clone()),
                AdapterCommand::DiscoverServices {
                    peripheral: id.clone(),
                    services: vec![AttributeId::new(0x180F), AttributeId::new(0x180D)],
                },
            ]
        );

        harness
            .event(AdapterEvent::PeripheralDisconnected {
                peripheral: id.clone(),
                error: None,
            })
            .await;
        let record = harness.record(&id);
        assert_eq!(record.connection_state, ConnectionState::Disconnected);
        assert_eq!(record.status(), PeripheralStatus::Known);
        assert_eq!(harness.manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_already_connected_skips_adapter() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;
        harness.adapter.take_commands();

        harness.command(connect(&id, None)).await.unwrap();
        assert!(harness.adapter.commands().is_empty());
        assert_eq!(harness.record(&id).connection_state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_unknown_identity_is_ignored() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("never-seen");

        harness.command(connect(&id, None)).await.unwrap();
        assert!(harness.manager.registry().is_empty());
        assert!(harness.adapter.commands().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_connect_returns_to_disconnected() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -60)).await;
        harness.adapter.set_failing(true);
        harness.command(connect(&id, None)).await.unwrap();
        assert_eq!(harness.record(&id).connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connection_failure_event() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -60)).await;
        harness.command(connect(&id, Some(PollingPolicy::new(1, 10)))).await.unwrap();
        harness
            .event(AdapterEvent::ConnectionFailed {
                peripheral: id.clone(),
                error: "peer unreachable".to_string(),
            })
            .await;

        assert_eq!(harness.record(&id).connection_state, ConnectionState::Disconnected);
        assert!(!harness.cache.is_known(&id).await);
        assert!(!harness.manager.poller.is_active(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_replaces_poll_timer() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -60)).await;

        harness
            .command(connect(&id, Some(PollingPolicy::new(1, 60))))
            .await
            .unwrap();
        harness.connected(&id).await;
        sleep(Duration::from_millis(2500)).await;
        harness.pump_timers().await;
        harness.adapter.take_commands();

        harness
            .command(connect(&id, Some(PollingPolicy::new(2, 60))))
            .await
            .unwrap();
        assert_eq!(harness.manager.poller.active_count(), 1);
        assert_eq!(
            harness.record(&id).polling,
            Some(PollingPolicy::new(2, 60))
        );

        // 4.5s after the replacement only the new 2s timer ticked
        sleep(Duration::from_millis(4500)).await;
        harness.pump_timers().await;
        let reads = harness.adapter.count(&AdapterCommand::ReadRssi(id.clone()));
        assert_eq!(reads, 2);
        assert_eq!(harness.adapter.count(&AdapterCommand::Connect(id)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timer_cancelled_on_disconnect() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -60)).await;
        harness
            .command(connect(&id, Some(PollingPolicy::new(1, 60))))
            .await
            .unwrap();
        harness.connected(&id).await;

        harness
            .command(ManagerCommand::Disconnect {
                peripheral: id.clone(),
                forget: false,
            })
            .await
            .unwrap();
        harness.adapter.take_commands();

        sleep(Duration::from_secs(5)).await;
        harness.pump_timers().await;
        assert_eq!(harness.adapter.count(&AdapterCommand::ReadRssi(id.clone())), 0);
        assert!(harness.cache.is_known(&id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timer_times_out() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -60)).await;
        harness
            .command(connect(&id, Some(PollingPolicy::new(2, 5))))
            .await
            .unwrap();
        harness.connected(&id).await;
        harness.adapter.take_commands();

        sleep(Duration::from_secs(20)).await;
        harness.pump_timers().await;
        assert_eq!(harness.adapter.count(&AdapterCommand::ReadRssi(id.clone())), 2);
        assert!(!harness.manager.poller.is_active(&id));
        assert_eq!(harness.record(&id).polling, None);
    }

    #[tokio::test]
    async fn test_disconnect_and_forget() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;
        harness.adapter.take_commands();

        harness
            .command(ManagerCommand::Disconnect {
                peripheral: id.clone(),
                forget: true,
            })
            .await
            .unwrap();
        assert_eq!(
            harness.adapter.commands(),
            vec![AdapterCommand::Disconnect(id.clone())]
        );
        assert!(!harness.cache.is_known(&id).await);
        assert!(!harness.record(&id).is_known);
        // state only changes when the adapter reports it
        assert_eq!(harness.record(&id).connection_state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_a_no_op() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");

        // no record at all
        harness
            .command(ManagerCommand::Disconnect {
                peripheral: id.clone(),
                forget: true,
            })
            .await
            .unwrap();
        assert!(harness.adapter.commands().is_empty());

        // known but no longer connected
        harness.connected(&id).await;
        harness
            .event(AdapterEvent::PeripheralDisconnected {
                peripheral: id.clone(),
                error: None,
            })
            .await;
        harness.adapter.take_commands();
        harness
            .command(ManagerCommand::Disconnect {
                peripheral: id.clone(),
                forget: true,
            })
            .await
            .unwrap();
        assert!(harness.adapter.commands().is_empty());
        assert!(harness.cache.is_known(&id).await);
        assert!(harness.record(&id).is_known);
    }

    #[tokio::test]
    async fn test_late_discovery_does_not_revive_forgotten_device() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;
        harness
            .command(ManagerCommand::Disconnect {
                peripheral: id.clone(),
                forget: true,
            })
            .await
            .unwrap();

        harness
            .event(AdapterEvent::CharacteristicsDiscovered {
                peripheral: id.clone(),
                service: AttributeId::new(0x180D),
                characteristics: Ok(vec![DiscoveredCharacteristic {
                    id: AttributeId::new(0x2A37),
                    properties: CharacteristicProperties {
                        read: false,
                        notify: true,
                    },
                }]),
            })
            .await;

        assert!(!harness.cache.is_known(&id).await);
        assert!(harness.cache.details(&id).await.is_none());
        assert!(harness.manager.known_devices().await.is_empty());
        assert!(!harness.record(&id).is_known);
    }

    #[tokio::test]
    async fn test_forget_twice() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;

        harness.command(ManagerCommand::Forget(id.clone())).await.unwrap();
        harness.command(ManagerCommand::Forget(id.clone())).await.unwrap();
        assert!(harness.cache.list_known_identities().await.is_empty());
        assert_eq!(harness.record(&id).status(), PeripheralStatus::Connected);
    }

    #[tokio::test]
    async fn test_discovery_flow_updates_record_and_cache() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;
        harness.adapter.take_commands();

        harness
            .event(AdapterEvent::ServicesDiscovered {
                peripheral: id.clone(),
                services: Ok(vec![AttributeId::new(0x1800), AttributeId::new(0x180D)]),
            })
            .await;
        assert_eq!(
            harness.record(&id).services,
            Some(vec![ServiceDescriptor {
                kind: ServiceKind::HeartRate,
                characteristics: vec![],
            }])
        );

        harness
            .event(AdapterEvent::CharacteristicsDiscovered {
                peripheral: id.clone(),
                service: AttributeId::new(0x180D),
                characteristics: Ok(vec![
                    DiscoveredCharacteristic {
                        id: AttributeId::new(0x2A37),
                        properties: CharacteristicProperties {
                            read: false,
                            notify: true,
                        },
                    },
                    DiscoveredCharacteristic {
                        id: AttributeId::new(0x2A38),
                        properties: CharacteristicProperties {
                            read: true,
                            notify: false,
                        },
                    },
                ]),
            })
            .await;

        let services = harness.record(&id).services.unwrap();
        assert_eq!(
            services[0].characteristics,
            vec![
                CharacteristicKind::HeartRateMeasurement,
                CharacteristicKind::BodySensorLocation
            ]
        );
        let entry = harness.cache.details(&id).await.unwrap();
        assert!(entry.service_kinds.contains(&AttributeId::new(0x180D)));
        assert!(entry.characteristic_ids.contains(&AttributeId::new(0x2A37)));
        assert_eq!(harness.manager.known_devices().await, vec![entry]);
    }

    #[tokio::test]
    async fn test_discovery_errors_leave_record_alone() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;
        harness
            .event(AdapterEvent::ServicesDiscovered {
                peripheral: id.clone(),
                services: Err("timeout".to_string()),
            })
            .await;
        assert_eq!(harness.record(&id).services, None);
    }

    #[tokio::test]
    async fn test_values_are_routed() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;

        for (characteristic, bytes) in [
            (0x2A37, vec![0x00, 0x48]),
            (0x2A19, vec![0x5A]),
            (0x2A38, vec![0x02]),
        ] {
            harness
                .event(AdapterEvent::CharacteristicValueUpdated {
                    peripheral: id.clone(),
                    characteristic: AttributeId::new(characteristic),
                    value: Ok(bytes),
                })
                .await;
        }

        let record = harness.record(&id);
        assert_eq!(record.heart_rate(), Some(72));
        assert_eq!(record.battery_level(), Some(90));
        assert_eq!(record.body_sensor_location(), Some(BodySensorLocation::Wrist));

        // malformed payloads do not touch the record
        harness
            .event(AdapterEvent::CharacteristicValueUpdated {
                peripheral: id.clone(),
                characteristic: AttributeId::new(0x2A38),
                value: Ok(vec![0x09]),
            })
            .await;
        assert_eq!(
            harness.record(&id).values.get(&CharacteristicKind::BodySensorLocation),
            Some(&CharacteristicValue::BodySensorLocation(BodySensorLocation::Wrist))
        );
    }

    #[tokio::test]
    async fn test_unregistered_values_are_dropped() {
        let (adapter, events) = FakeAdapter::channel(4);
        let mut harness = Harness::new(adapter, events);
        harness
            .manager
            .require_service(ServiceDescriptor::battery())
            .unwrap();
        harness.command(ManagerCommand::Start).await.unwrap();
        harness.power_on().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;

        harness
            .event(AdapterEvent::CharacteristicValueUpdated {
                peripheral: id.clone(),
                characteristic: AttributeId::new(0x2A37),
                value: Ok(vec![0x00, 0x48]),
            })
            .await;
        assert!(harness.record(&id).values.is_empty());
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Invariant breach")]
    async fn test_control_point_value_aborts_debug_builds() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;
        harness
            .event(AdapterEvent::CharacteristicValueUpdated {
                peripheral: id,
                characteristic: AttributeId::new(0x2A39),
                value: Ok(vec![0x01]),
            })
            .await;
    }

    #[tokio::test]
    async fn test_rssi_read_updates_signal_strength() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.connected(&id).await;
        harness
            .event(AdapterEvent::RssiRead {
                peripheral: id.clone(),
                rssi: Ok(-65),
            })
            .await;
        assert_eq!(harness.record(&id).signal_strength, Some(SignalStrength::Fair));

        // unknown identities are not created by RSSI samples
        harness
            .event(AdapterEvent::RssiRead {
                peripheral: "ghost".into(),
                rssi: Ok(-40),
            })
            .await;
        assert_eq!(harness.manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_retrieved_peripherals_are_connected() {
        let (adapter, events) = FakeAdapter::channel(4);
        let config = BluetoothConfig {
            reconnect_polling: Some(PollingPolicy::new(5, 60)),
            ..BluetoothConfig::default()
        };
        let mut harness = Harness::ready_with(adapter, events, config).await;
        let id = PeripheralId::new("D1");
        harness.cache.remember(&id).await;

        harness
            .event(AdapterEvent::PeripheralsRetrieved(vec![RetrievedPeripheral {
                id: id.clone(),
                name: Some("Strap".to_string()),
                state: ConnectionState::Disconnected,
            }]))
            .await;

        let record = harness.record(&id);
        assert_eq!(record.connection_state, ConnectionState::Connecting);
        assert_eq!(record.polling, Some(PollingPolicy::new(5, 60)));
        assert!(record.is_known);
        assert_eq!(record.display_name(), "Strap");
        assert_eq!(
            harness.adapter.commands(),
            vec![AdapterCommand::Connect(id)]
        );
    }

    #[tokio::test]
    async fn test_retrieved_connected_peripheral_keeps_its_connection() {
        let (adapter, events) = FakeAdapter::channel(4);
        let config = BluetoothConfig {
            reconnect_polling: Some(PollingPolicy::new(5, 60)),
            ..BluetoothConfig::default()
        };
        let mut harness = Harness::ready_with(adapter, events, config).await;
        let id = PeripheralId::new("D1");

        harness
            .event(AdapterEvent::PeripheralsRetrieved(vec![RetrievedPeripheral {
                id: id.clone(),
                name: None,
                state: ConnectionState::Connected,
            }]))
            .await;

        let record = harness.record(&id);
        assert_eq!(record.connection_state, ConnectionState::Connected);
        assert_eq!(record.polling, Some(PollingPolicy::new(5, 60)));
        assert!(harness.manager.poller.is_active(&id));
        assert!(harness.cache.is_known(&id).await);
        assert_eq!(harness.adapter.count(&AdapterCommand::Connect(id.clone())), 0);
        assert_eq!(
            harness.adapter.commands(),
            vec![
                AdapterCommand::ReadRssi(id.clone()),
                AdapterCommand::DiscoverServices {
                    peripheral: id,
                    services: vec![AttributeId::new(0x180F), AttributeId::new(0x180D)],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let mut harness = Harness::ready().await;
        let id = PeripheralId::new("D1");
        harness.event(discovered(&id, -60)).await;
        harness
            .command(connect(&id, Some(PollingPolicy::new(1, 60))))
            .await
            .unwrap();
        harness.connected(&id).await;
        harness.command(ManagerCommand::Scan).await.unwrap();
        harness.adapter.take_commands();

        harness.manager.shutdown().await;
        assert!(harness.manager.registry().is_empty());
        assert_eq!(harness.manager.poller.active_count(), 0);
        assert!(!harness.manager.scanner.is_active());
        assert_eq!(harness.adapter.commands(), vec![AdapterCommand::StopScan]);
        // the cache outlives the session
        assert!(harness.cache.is_known(&id).await);
    }
}
