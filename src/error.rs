//! Error types for peripheral management
//! Every variant except `InvariantBreach` is recoverable: the orchestrator
//! logs it and carries on.

use thiserror::Error;

use crate::core::bluetooth::decoder::DecodeError;

/// Main error type for peripheral operations
#[derive(Error, Debug)]
pub enum BluetoothError {
    /// A command arrived before the adapter was powered on
    #[error("Bluetooth adapter is not ready")]
    AdapterNotReady,

    /// An identifier that the attribute catalog does not know
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    /// A characteristic registered under a service that does not own it
    #[error("Characteristic {characteristic} does not belong to service {service}")]
    CharacteristicMismatch {
        /// The offending characteristic id
        characteristic: String,
        /// The service it was registered under
        service: String,
    },

    /// Malformed characteristic payload
    #[error("Decode failure: {0}")]
    Decode(#[from] DecodeError),

    /// The device cache could not reach its store
    #[error("Persistence degraded: {0}")]
    PersistenceDegraded(String),

    /// A registered characteristic the decoder cannot handle
    #[error("Invariant breach: {0}")]
    InvariantBreach(String),

    /// `require_service` called after `start`
    #[error("Service registration is closed once the manager has started")]
    RegistrationClosed,

    /// The orchestrator task is gone
    #[error("Bluetooth manager has stopped")]
    ManagerStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BluetoothError {
    /// Whether the orchestrator may continue after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BluetoothError::InvariantBreach(_))
    }
}

/// Result type alias for peripheral operations
pub type Result<T> = std::result::Result<T, BluetoothError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BluetoothError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BluetoothError::ManagerStopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for BluetoothError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        BluetoothError::ManagerStopped
    }
}
