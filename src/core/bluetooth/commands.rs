//! Commands sent to the radio adapter
//! The adapter executes these asynchronously and reports outcomes as
//! `AdapterEvent`s on its event channel.

use anyhow::Result;

use crate::core::bluetooth::attribute::AttributeId;
use crate::core::bluetooth::types::PeripheralId;

/// Adapter commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCommand {
    /// Bring up the radio stack (and trigger the OS authorization prompt if needed)
    Activate,
    /// Scan for peripherals advertising any of `services`; empty means no filter
    StartScan { services: Vec<AttributeId> },
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    /// Discover only the listed services on a connected peripheral
    DiscoverServices {
        peripheral: PeripheralId,
        services: Vec<AttributeId>,
    },
    /// Discover only the listed characteristics of one service
    DiscoverCharacteristics {
        peripheral: PeripheralId,
        service: AttributeId,
        characteristics: Vec<AttributeId>,
    },
    ReadValue {
        peripheral: PeripheralId,
        characteristic: AttributeId,
    },
    SetNotify {
        peripheral: PeripheralId,
        characteristic: AttributeId,
        enabled: bool,
    },
    ReadRssi(PeripheralId),
    /// Look up peripherals the system already knows by identity
    RetrievePeripherals(Vec<PeripheralId>),
    /// Look up peripherals already connected to the system that expose `services`
    RetrieveConnectedPeripherals(Vec<AttributeId>),
}

impl AdapterCommand {
    /// The peripheral this command targets, if any
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            Self::Connect(id) | Self::Disconnect(id) | Self::ReadRssi(id) => Some(id),
            Self::DiscoverServices { peripheral, .. }
            | Self::DiscoverCharacteristics { peripheral, .. }
            | Self::ReadValue { peripheral, .. }
            | Self::SetNotify { peripheral, .. } => Some(peripheral),
            Self::Activate
            | Self::StartScan { .. }
            | Self::StopScan
            | Self::RetrievePeripherals(_)
            | Self::RetrieveConnectedPeripherals(_) => None,
        }
    }
}

/// Whether the user allowed this process to use Bluetooth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    NotDetermined,
    Denied,
    Allowed,
}

/// The radio stack
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Current authorization, checked once at startup
    fn authorization(&self) -> Authorization;

    /// Hand a command to the adapter. Returning `Ok` only means it was accepted.
    async fn send_command(&self, command: AdapterCommand) -> Result<()>;
}
