//! Known-device cache
//! Remembers which peripherals the user has connected to, and which of the
//! registered services they exposed, across process restarts.
//!
//! Layout in the store:
//! - `peripheral.identifiers.list` holds the ordered list of known identities
//! - `<identity>` holds `{"serviceKinds": [...], "characteristicIds": [...]}`
//!
//! Store failures never propagate. The cache logs them and behaves as if
//! nothing were cached.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::attribute::{AttributeId, ServiceDescriptor};
use crate::core::bluetooth::constants::KNOWN_IDENTIFIERS_KEY;
use crate::core::bluetooth::store::KeyValueStore;
use crate::core::bluetooth::types::PeripheralId;
use crate::error::{BluetoothError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedDetails {
    service_kinds: Vec<AttributeId>,
    characteristic_ids: Vec<AttributeId>,
}

/// What the cache remembers about one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedDeviceEntry {
    pub id: PeripheralId,
    pub service_kinds: BTreeSet<AttributeId>,
    pub characteristic_ids: BTreeSet<AttributeId>,
}

#[derive(Clone)]
pub struct DeviceCache {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn is_known(&self, id: &PeripheralId) -> bool {
        self.list_known_identities().await.contains(id)
    }

    /// Known identities in the order they were first remembered
    pub async fn list_known_identities(&self) -> Vec<PeripheralId> {
        degrade(self.load_identities().await)
            .into_iter()
            .map(PeripheralId::new)
            .collect()
    }

    /// Adds `id` to the known list. Idempotent.
    pub async fn remember(&self, id: &PeripheralId) {
        degrade(self.try_remember(id).await)
    }

    /// Persists the service and characteristic ids confirmed on `id`.
    /// Identities that are not known (never remembered, or forgotten) are
    /// left alone.
    pub async fn record_services(&self, id: &PeripheralId, services: &[ServiceDescriptor]) {
        if !self.is_known(id).await {
            debug!("Not storing services for unknown peripheral {}", id);
            return;
        }
        degrade(self.try_record_services(id, services).await)
    }

    /// Drops `id` and its details. Forgetting an unknown identity is a no-op.
    pub async fn forget(&self, id: &PeripheralId) {
        degrade(self.try_forget(id).await)
    }

    /// The persisted entry for `id`, if it is known
    pub async fn details(&self, id: &PeripheralId) -> Option<CachedDeviceEntry> {
        if !self.is_known(id).await {
            return None;
        }
        degrade(self.try_details(id).await.map(Some))
    }

    async fn try_remember(&self, id: &PeripheralId) -> Result<()> {
        let mut identities = self.load_identities().await?;
        if identities.iter().any(|known| known == id.as_str()) {
            return Ok(());
        }
        identities.push(id.to_string());
        self.save_identities(&identities).await?;
        info!("Remembered peripheral {}", id);
        Ok(())
    }

    async fn try_record_services(
        &self,
        id: &PeripheralId,
        services: &[ServiceDescriptor],
    ) -> Result<()> {
        let mut details = PersistedDetails::default();
        for service in services {
            let kind = service.kind.id();
            if !details.service_kinds.contains(&kind) {
                details.service_kinds.push(kind);
            }
            for characteristic in &service.characteristics {
                if !details.characteristic_ids.contains(&characteristic.id()) {
                    details.characteristic_ids.push(characteristic.id());
                }
            }
        }

        let value = serde_json::to_value(&details)?;
        self.store
            .set(id.as_str(), value)
            .await
            .map_err(|e| BluetoothError::PersistenceDegraded(e.to_string()))?;
        debug!("Stored service details for {}: {:?}", id, details);
        Ok(())
    }

    async fn try_forget(&self, id: &PeripheralId) -> Result<()> {
        let mut identities = self.load_identities().await?;
        let before = identities.len();
        identities.retain(|known| known != id.as_str());
        if identities.len() != before {
            self.save_identities(&identities).await?;
            info!("Forgot peripheral {}", id);
        }
        self.store
            .delete(id.as_str())
            .await
            .map_err(|e| BluetoothError::PersistenceDegraded(e.to_string()))
    }

    async fn try_details(&self, id: &PeripheralId) -> Result<CachedDeviceEntry> {
        let value = self
            .store
            .get(id.as_str())
            .await
            .map_err(|e| BluetoothError::PersistenceDegraded(e.to_string()))?;
        let details = match value {
            Some(value) => serde_json::from_value::<PersistedDetails>(value)?,
            None => PersistedDetails::default(),
        };
        Ok(CachedDeviceEntry {
            id: id.clone(),
            service_kinds: details.service_kinds.into_iter().collect(),
            characteristic_ids: details.characteristic_ids.into_iter().collect(),
        })
    }

    async fn load_identities(&self) -> Result<Vec<String>> {
        let value = self
            .store
            .get(KNOWN_IDENTIFIERS_KEY)
            .await
            .map_err(|e| BluetoothError::PersistenceDegraded(e.to_string()))?;
        match value {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_identities(&self, identities: &[String]) -> Result<()> {
        let value = serde_json::to_value(identities)?;
        self.store
            .set(KNOWN_IDENTIFIERS_KEY, value)
            .await
            .map_err(|e| BluetoothError::PersistenceDegraded(e.to_string()))
    }
}

fn degrade<T: Default>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("Device cache unavailable, treating as empty: {}", e);
            T::default()
        }
    }
}
