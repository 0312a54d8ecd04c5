//! Connection handling for registered peripherals
//! Owns the outbound side of a connection: connect and disconnect requests,
//! service and characteristic discovery scoped to the registrations, and the
//! read/notify subscription policy.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::core::bluetooth::attribute::{
    AttributeId, CharacteristicKind, Registrations, ServiceDescriptor, ServiceKind,
};
use crate::core::bluetooth::commands::{Adapter, AdapterCommand};
use crate::core::bluetooth::events::DiscoveredCharacteristic;
use crate::core::bluetooth::types::PeripheralId;

#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Arc<dyn Adapter>,
}

impl ConnectionManager {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self { adapter }
    }

    /// Sends `command`, logging a rejection. Returns whether the adapter accepted it.
    pub async fn send(&self, command: AdapterCommand) -> bool {
        debug!("Sending {:?}", command);
        match self.adapter.send_command(command.clone()).await {
            Ok(()) => true,
            Err(e) => {
                error!("Adapter rejected {:?}: {}", command, e);
                false
            }
        }
    }

    pub async fn connect(&self, id: &PeripheralId) -> bool {
        info!("Initiating connection to {}...", id);
        self.send(AdapterCommand::Connect(id.clone())).await
    }

    pub async fn disconnect(&self, id: &PeripheralId) -> bool {
        info!("Disconnecting from {}", id);
        self.send(AdapterCommand::Disconnect(id.clone())).await
    }

    /// Asks `id` for the registered services only. Does nothing when no
    /// service is registered.
    pub async fn discover_services(&self, id: &PeripheralId, registrations: &Registrations) {
        if registrations.is_empty() {
            debug!("No services registered, skipping discovery on {}", id);
            return;
        }
        self.send(AdapterCommand::DiscoverServices {
            peripheral: id.clone(),
            services: registrations.service_ids(),
        })
        .await;
    }

    /// Keeps the discovered services that are registered and asks for their
    /// registered characteristics. Returns the confirmed services.
    pub async fn on_services_discovered(
        &self,
        id: &PeripheralId,
        discovered: &[AttributeId],
        registrations: &Registrations,
    ) -> Vec<ServiceKind> {
        let confirmed = confirm_services(discovered, registrations);
        for kind in &confirmed {
            let characteristics: Vec<AttributeId> = registrations
                .characteristics_for(*kind)
                .iter()
                .map(|c| c.id())
                .collect();
            info!("Found service {} on {}", kind, id);
            self.send(AdapterCommand::DiscoverCharacteristics {
                peripheral: id.clone(),
                service: kind.id(),
                characteristics,
            })
            .await;
        }
        confirmed
    }

    /// Subscribes to the registered characteristics of `service`: a one-shot
    /// read if readable, notifications if notifiable. Returns the confirmed
    /// characteristics.
    pub async fn on_characteristics_discovered(
        &self,
        id: &PeripheralId,
        service: AttributeId,
        discovered: &[DiscoveredCharacteristic],
        registrations: &Registrations,
    ) -> Vec<CharacteristicKind> {
        let Some(kind) = registrations.service_kind(service) else {
            warn!("Characteristics reported for unregistered service {} on {}", service, id);
            return Vec::new();
        };
        let wanted = registrations.characteristics_for(kind);

        let mut confirmed = Vec::new();
        for characteristic in discovered {
            let Some(found) = CharacteristicKind::from_id(characteristic.id)
                .filter(|c| wanted.contains(c))
            else {
                debug!("Ignoring characteristic {} on {}", characteristic.id, id);
                continue;
            };
            if confirmed.contains(&found) {
                continue;
            }
            confirmed.push(found);

            if characteristic.properties.read {
                self.send(AdapterCommand::ReadValue {
                    peripheral: id.clone(),
                    characteristic: characteristic.id,
                })
                .await;
            }
            if characteristic.properties.notify {
                self.send(AdapterCommand::SetNotify {
                    peripheral: id.clone(),
                    characteristic: characteristic.id,
                    enabled: true,
                })
                .await;
            }
        }
        confirmed
    }
}

/// Discovered service ids intersected with the registrations, in discovery order
pub fn confirm_services(discovered: &[AttributeId], registrations: &Registrations) -> Vec<ServiceKind> {
    let mut confirmed = Vec::new();
    for id in discovered {
        match registrations.service_kind(*id) {
            Some(kind) if !confirmed.contains(&kind) => confirmed.push(kind),
            Some(_) => {}
            None => debug!("Dropping unregistered service {}", id),
        }
    }
    confirmed
}

/// Merges confirmed characteristics of `kind` into a record's service list
pub fn merge_confirmed(
    services: &mut Vec<ServiceDescriptor>,
    kind: ServiceKind,
    characteristics: Vec<CharacteristicKind>,
) {
    match services.iter_mut().find(|s| s.kind == kind) {
        Some(service) => service.characteristics = characteristics,
        None => services.push(ServiceDescriptor {
            kind,
            characteristics,
        }),
    }
}
