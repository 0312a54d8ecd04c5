//! Inbound characteristic value routing
//! Updates for characteristics nobody registered are dropped before they
//! reach the decoder.

use log::{debug, error};

use crate::core::bluetooth::attribute::{AttributeId, CharacteristicKind, Registrations};
use crate::core::bluetooth::decoder::{CharacteristicValue, DecodeError, decode};
use crate::error::{BluetoothError, Result};

/// Decodes an update for `characteristic`.
///
/// Returns `Ok(None)` when the characteristic is not registered,
/// `Err(BluetoothError::Decode)` for a malformed payload and
/// `Err(BluetoothError::InvariantBreach)` for a registered characteristic the
/// decoder has no rule for.
pub fn route_value(
    registrations: &Registrations,
    characteristic: AttributeId,
    bytes: &[u8],
) -> Result<Option<CharacteristicValue>> {
    if !registrations.contains_characteristic(characteristic) {
        debug!("Dropping update for unregistered characteristic {}", characteristic);
        return Ok(None);
    }
    let kind = CharacteristicKind::from_id(characteristic).ok_or_else(|| {
        BluetoothError::InvariantBreach(format!(
            "registered characteristic {} is not in the catalog",
            characteristic
        ))
    })?;

    match decode(kind, bytes) {
        Ok(value) => Ok(Some(value)),
        Err(DecodeError::Unsupported(kind)) => Err(BluetoothError::InvariantBreach(format!(
            "no decoder for registered characteristic {}",
            kind
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Aborts debug builds; release builds log and carry on
pub fn report_invariant_breach(error: &BluetoothError) {
    error!("{}", error);
    if cfg!(debug_assertions) {
        panic!("{}", error);
    }
}
