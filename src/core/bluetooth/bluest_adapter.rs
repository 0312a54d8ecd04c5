//! Adapter backed by the system Bluetooth stack through `bluest`
//! Each command runs on its own task and reports back as an `AdapterEvent`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use bluest::{Characteristic, Device, Service, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::attribute::AttributeId;
use crate::core::bluetooth::commands::{Adapter, AdapterCommand, Authorization};
use crate::core::bluetooth::events::{
    AdapterEvent, CharacteristicProperties, DiscoveredCharacteristic, HardwareState,
    RetrievedPeripheral,
};
use crate::core::bluetooth::types::{ConnectionState, PeripheralId};

type AttributeKey = (PeripheralId, AttributeId);

struct Inner {
    adapter: bluest::Adapter,
    events: mpsc::Sender<AdapterEvent>,
    devices: Mutex<HashMap<PeripheralId, Device>>,
    services: Mutex<HashMap<AttributeKey, Service>>,
    characteristics: Mutex<HashMap<AttributeKey, Characteristic>>,
    notifications: Mutex<HashMap<AttributeKey, CancellationToken>>,
    scan_cancel: Mutex<CancellationToken>,
}

#[derive(Clone)]
pub struct BluestAdapter {
    inner: Arc<Inner>,
}

impl BluestAdapter {
    /// Opens the default system adapter. Events are delivered on `events`.
    pub async fn new(events: mpsc::Sender<AdapterEvent>) -> Result<Self> {
        let adapter = bluest::Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        Ok(Self {
            inner: Arc::new(Inner {
                adapter,
                events,
                devices: Mutex::new(HashMap::new()),
                services: Mutex::new(HashMap::new()),
                characteristics: Mutex::new(HashMap::new()),
                notifications: Mutex::new(HashMap::new()),
                scan_cancel: Mutex::new(CancellationToken::new()),
            }),
        })
    }
}

#[async_trait::async_trait]
impl Adapter for BluestAdapter {
    fn authorization(&self) -> Authorization {
        // the system stack prompts on first use
        Authorization::Allowed
    }

    async fn send_command(&self, command: AdapterCommand) -> Result<()> {
        debug!("Executing {:?}", command);
        let inner = self.inner.clone();
        match command {
            AdapterCommand::StopScan => {
                inner.scan_cancel.lock().await.cancel();
                info!("Stopping Bluetooth scan.");
            }
            AdapterCommand::StartScan { services } => {
                let cancel_token = CancellationToken::new();
                {
                    let mut current = inner.scan_cancel.lock().await;
                    current.cancel();
                    *current = cancel_token.clone();
                }
                tokio::spawn(async move {
                    if let Err(e) = inner.scan(&services, cancel_token).await {
                        error!("Bluetooth scan failed: {}", e);
                    }
                });
            }
            AdapterCommand::SetNotify {
                peripheral,
                characteristic,
                enabled: false,
            } => {
                if let Some(token) = inner
                    .notifications
                    .lock()
                    .await
                    .remove(&(peripheral, characteristic))
                {
                    token.cancel();
                }
            }
            command => {
                tokio::spawn(async move { inner.execute(command).await });
            }
        }
        Ok(())
    }
}

impl Inner {
    async fn emit(&self, event: AdapterEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Adapter event dropped, nobody is listening");
        }
    }

    async fn device(&self, id: &PeripheralId) -> Option<Device> {
        self.devices.lock().await.get(id).cloned()
    }

    async fn remember_device(&self, device: &Device) -> PeripheralId {
        let id = PeripheralId::new(device.id().to_string());
        self.devices.lock().await.insert(id.clone(), device.clone());
        id
    }

    async fn execute(self: Arc<Self>, command: AdapterCommand) {
        match command {
            AdapterCommand::Activate => self.watch_power().await,
            AdapterCommand::Connect(id) => self.connect(id).await,
            AdapterCommand::Disconnect(id) => self.disconnect(id).await,
            AdapterCommand::DiscoverServices {
                peripheral,
                services,
            } => {
                let result = self.discover_services(&peripheral, &services).await;
                self.emit(AdapterEvent::ServicesDiscovered {
                    peripheral,
                    services: result.map_err(|e| e.to_string()),
                })
                .await;
            }
            AdapterCommand::DiscoverCharacteristics {
                peripheral,
                service,
                characteristics,
            } => {
                let result = self
                    .discover_characteristics(&peripheral, service, &characteristics)
                    .await;
                self.emit(AdapterEvent::CharacteristicsDiscovered {
                    peripheral,
                    service,
                    characteristics: result.map_err(|e| e.to_string()),
                })
                .await;
            }
            AdapterCommand::ReadValue {
                peripheral,
                characteristic,
            } => {
                let found = self
                    .characteristics
                    .lock()
                    .await
                    .get(&(peripheral.clone(), characteristic))
                    .cloned();
                let value = match found {
                    Some(found) => found.read().await.map_err(|e| e.to_string()),
                    None => Err(format!("characteristic {} not discovered", characteristic)),
                };
                self.emit(AdapterEvent::CharacteristicValueUpdated {
                    peripheral,
                    characteristic,
                    value,
                })
                .await;
            }
            AdapterCommand::SetNotify {
                peripheral,
                characteristic,
                ..
            } => self.subscribe(peripheral, characteristic).await,
            AdapterCommand::ReadRssi(id) => {
                let rssi = match self.device(&id).await {
                    Some(device) => device.rssi().await.map_err(|e| e.to_string()),
                    None => Err(format!("unknown peripheral {}", id)),
                };
                self.emit(AdapterEvent::RssiRead {
                    peripheral: id,
                    rssi,
                })
                .await;
            }
            AdapterCommand::RetrievePeripherals(ids) => {
                if let Err(e) = self.retrieve(&ids).await {
                    error!("Retrieving known peripherals failed: {}", e);
                }
            }
            AdapterCommand::RetrieveConnectedPeripherals(services) => {
                if let Err(e) = self.retrieve_connected(&services).await {
                    error!("Retrieving connected peripherals failed: {}", e);
                }
            }
            AdapterCommand::StartScan { .. } | AdapterCommand::StopScan => {}
        }
    }

    async fn watch_power(&self) {
        if let Err(e) = self.adapter.wait_available().await {
            error!("Bluetooth adapter never became available: {}", e);
            self.emit(AdapterEvent::HardwareStateChanged(HardwareState::Unsupported))
                .await;
            return;
        }
        info!("Bluetooth adapter is available.");
        self.emit(AdapterEvent::HardwareStateChanged(HardwareState::PoweredOn))
            .await;

        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Adapter power events unavailable: {}", e);
                return;
            }
        };
        while let Some(event) = events.next().await {
            let state = match event {
                Ok(bluest::AdapterEvent::Available) => HardwareState::PoweredOn,
                Ok(bluest::AdapterEvent::Unavailable) => HardwareState::PoweredOff,
                Err(e) => {
                    error!("Error in adapter event stream: {}", e);
                    break;
                }
            };
            self.emit(AdapterEvent::HardwareStateChanged(state)).await;
        }
    }

    async fn scan(&self, services: &[AttributeId], cancel_token: CancellationToken) -> Result<()> {
        let uuids: Vec<Uuid> = services.iter().map(AttributeId::to_uuid).collect();
        info!("Starting bluetooth scan for {:?}", services);
        let mut scan_stream = self.adapter.scan(&uuids).await?;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(discovered) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    let id = self.remember_device(&discovered.device).await;
                    let name = discovered
                        .adv_data
                        .local_name
                        .clone()
                        .or_else(|| discovered.device.name().ok());
                    let advertised_services = discovered
                        .adv_data
                        .services
                        .iter()
                        .filter_map(AttributeId::from_uuid)
                        .collect();
                    self.emit(AdapterEvent::PeripheralDiscovered {
                        peripheral: id,
                        name,
                        rssi: discovered.rssi,
                        advertised_services,
                    })
                    .await;
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }

    async fn connect(&self, id: PeripheralId) {
        let Some(device) = self.device(&id).await else {
            self.emit(AdapterEvent::ConnectionFailed {
                peripheral: id.clone(),
                error: format!("unknown peripheral {}", id),
            })
            .await;
            return;
        };

        let result = if device.is_connected().await {
            Ok(())
        } else {
            info!("Initiating connection to {}...", id);
            self.adapter.connect_device(&device).await
        };
        let event = match result {
            Ok(()) => AdapterEvent::PeripheralConnected {
                peripheral: id,
                name: device.name().ok(),
            },
            Err(e) => AdapterEvent::ConnectionFailed {
                peripheral: id,
                error: e.to_string(),
            },
        };
        self.emit(event).await;
    }

    async fn disconnect(&self, id: PeripheralId) {
        {
            let mut notifications = self.notifications.lock().await;
            notifications.retain(|(peripheral, _), token| {
                if *peripheral == id {
                    token.cancel();
                    false
                } else {
                    true
                }
            });
        }
        self.services.lock().await.retain(|(peripheral, _), _| *peripheral != id);
        self.characteristics
            .lock()
            .await
            .retain(|(peripheral, _), _| *peripheral != id);

        let error = match self.device(&id).await {
            Some(device) => self
                .adapter
                .disconnect_device(&device)
                .await
                .err()
                .map(|e| e.to_string()),
            None => Some(format!("unknown peripheral {}", id)),
        };
        self.emit(AdapterEvent::PeripheralDisconnected {
            peripheral: id,
            error,
        })
        .await;
    }

    async fn discover_services(
        &self,
        id: &PeripheralId,
        services: &[AttributeId],
    ) -> Result<Vec<AttributeId>> {
        let device = self
            .device(id)
            .await
            .ok_or_else(|| anyhow!("unknown peripheral {}", id))?;

        let mut found = Vec::new();
        for service in services {
            for discovered in device.discover_services_with_uuid(service.to_uuid()).await? {
                let Some(service_id) = AttributeId::from_uuid(&discovered.uuid()) else {
                    continue;
                };
                self.services
                    .lock()
                    .await
                    .insert((id.clone(), service_id), discovered);
                found.push(service_id);
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: AttributeId,
        characteristics: &[AttributeId],
    ) -> Result<Vec<DiscoveredCharacteristic>> {
        let service_handle = self
            .services
            .lock()
            .await
            .get(&(id.clone(), service))
            .cloned()
            .ok_or_else(|| anyhow!("service {} not discovered on {}", service, id))?;

        let mut found = Vec::new();
        for characteristic in characteristics {
            let discovered = service_handle
                .discover_characteristics_with_uuid(characteristic.to_uuid())
                .await?;
            for handle in discovered {
                let properties = handle.properties().await?;
                self.characteristics
                    .lock()
                    .await
                    .insert((id.clone(), *characteristic), handle);
                found.push(DiscoveredCharacteristic {
                    id: *characteristic,
                    properties: CharacteristicProperties {
                        read: properties.read,
                        notify: properties.notify || properties.indicate,
                    },
                });
            }
        }
        Ok(found)
    }

    async fn subscribe(&self, peripheral: PeripheralId, characteristic: AttributeId) {
        let key = (peripheral.clone(), characteristic);
        let Some(handle) = self.characteristics.lock().await.get(&key).cloned() else {
            warn!("Cannot subscribe to undiscovered {} on {}", characteristic, peripheral);
            return;
        };
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self
            .notifications
            .lock()
            .await
            .insert(key, cancel_token.clone())
        {
            previous.cancel();
        }

        info!("Subscribing to {} on {}", characteristic, peripheral);
        let mut stream = match handle.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(value) => {
                        self.emit(AdapterEvent::CharacteristicValueUpdated {
                            peripheral: peripheral.clone(),
                            characteristic,
                            value: value.map_err(|e| e.to_string()),
                        })
                        .await;
                    }
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        info!("Notification stream for {} on {} ended", characteristic, peripheral);
    }

    async fn retrieve(&self, ids: &[PeripheralId]) -> Result<()> {
        for device in self.adapter.connected_devices().await? {
            self.remember_device(&device).await;
        }
        let mut retrieved = Vec::new();
        for id in ids {
            if let Some(device) = self.device(id).await {
                retrieved.push(Self::describe(id.clone(), &device).await);
            } else {
                debug!("Peripheral {} is not visible to the system", id);
            }
        }
        self.emit(AdapterEvent::PeripheralsRetrieved(retrieved)).await;
        Ok(())
    }

    async fn retrieve_connected(&self, services: &[AttributeId]) -> Result<()> {
        let uuids: Vec<Uuid> = services.iter().map(AttributeId::to_uuid).collect();
        let mut retrieved = Vec::new();
        for device in self.adapter.connected_devices_with_services(&uuids).await? {
            let id = self.remember_device(&device).await;
            retrieved.push(Self::describe(id, &device).await);
        }
        self.emit(AdapterEvent::PeripheralsRetrieved(retrieved)).await;
        Ok(())
    }

    async fn describe(id: PeripheralId, device: &Device) -> RetrievedPeripheral {
        let state = if device.is_connected().await {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        RetrievedPeripheral {
            id,
            name: device.name().ok(),
            state,
        }
    }
}
