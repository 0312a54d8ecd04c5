//! In-memory set of peripheral records
//! One record per identity. Every mutation goes through `upsert` or
//! `update` and is republished on the change bus.

use std::collections::HashMap;

use futures_util::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::core::bluetooth::types::{ConnectionState, PeripheralId, PeripheralRecord};

/// A change to the registry
#[derive(Debug, Clone)]
pub enum RegistryChange {
    Updated(PeripheralRecord),
    Cleared,
}

/// Stream of individually updated records
pub type PeripheralStream = BoxStream<'static, PeripheralRecord>;

pub struct PeripheralRegistry {
    records: HashMap<PeripheralId, PeripheralRecord>,
    changes: broadcast::Sender<RegistryChange>,
}

impl PeripheralRegistry {
    pub fn new(changes: broadcast::Sender<RegistryChange>) -> Self {
        Self {
            records: HashMap::new(),
            changes,
        }
    }

    /// Fetches or creates the record for `id`, applies `mutation` and publishes it
    pub fn upsert<F>(&mut self, id: &PeripheralId, mutation: F) -> PeripheralRecord
    where
        F: FnOnce(&mut PeripheralRecord),
    {
        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(|| PeripheralRecord::new(id.clone()));
        mutation(record);
        let updated = record.clone();
        self.publish(RegistryChange::Updated(updated.clone()));
        updated
    }

    /// Like `upsert`, but leaves unknown identities alone
    pub fn update<F>(&mut self, id: &PeripheralId, mutation: F) -> Option<PeripheralRecord>
    where
        F: FnOnce(&mut PeripheralRecord),
    {
        let record = self.records.get_mut(id)?;
        mutation(record);
        let updated = record.clone();
        self.publish(RegistryChange::Updated(updated.clone()));
        Some(updated)
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&PeripheralRecord> {
        self.records.get(id)
    }

    pub fn filter(&self, state: ConnectionState) -> Vec<PeripheralRecord> {
        let mut matching: Vec<_> = self
            .records
            .values()
            .filter(|record| record.connection_state == state)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        matching
    }

    /// Snapshot of every record, ordered by identity
    pub fn all(&self) -> Vec<PeripheralRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops every record. Only used on teardown.
    pub fn clear(&mut self) {
        self.records.clear();
        self.publish(RegistryChange::Cleared);
    }

    fn publish(&self, change: RegistryChange) {
        // no subscribers is fine
        if self.changes.send(change).is_err() {
            debug!("Registry change dropped, nobody is subscribed");
        }
    }
}

/// Flattens registry changes into a stream of updated records
pub fn record_stream(receiver: broadcast::Receiver<RegistryChange>) -> PeripheralStream {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(RegistryChange::Updated(record)) => return Some((record, receiver)),
                Ok(RegistryChange::Cleared) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Peripheral subscriber lagged, skipped {} updates", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
