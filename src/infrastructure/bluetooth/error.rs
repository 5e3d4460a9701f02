//! BLE error taxonomy.

use crate::domain::models::{CharacteristicKind, SessionState};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("No usable Bluetooth adapter")]
    AdapterUnavailable,

    #[error("Peripheral address {address} is not resolvable")]
    AddressInvalid { address: String },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Link to peripheral lost")]
    LinkLost,

    #[error("Service discovery failed: {reason}")]
    DiscoverServicesFailed { reason: String },

    #[error("Failed to enable notifications for {field}: {reason}")]
    DescriptorWriteFailed {
        field: CharacteristicKind,
        reason: String,
    },

    #[error("Failed to read {field}: {reason}")]
    CharacteristicReadFailed {
        field: CharacteristicKind,
        reason: String,
    },

    #[error("Failed to update {field}: {reason}")]
    CharacteristicWriteFailed {
        field: CharacteristicKind,
        reason: String,
    },

    #[error("Peripheral rejected the {field} payload")]
    PayloadRejected { field: CharacteristicKind },

    #[error("Scan failed with error code: {code}")]
    ScanFailed { code: i32 },

    #[error("Operation not valid in state {state}")]
    InvalidState { state: SessionState },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BleError {
    /// Permission and adapter errors need user action outside the app.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PermissionDenied | Self::AdapterUnavailable)
    }

    /// Characteristic the failed operation targeted, if any.
    pub fn field(&self) -> Option<CharacteristicKind> {
        match self {
            Self::DescriptorWriteFailed { field, .. }
            | Self::CharacteristicReadFailed { field, .. }
            | Self::CharacteristicWriteFailed { field, .. }
            | Self::PayloadRejected { field } => Some(*field),
            _ => None,
        }
    }

    /// Map a btleplug failure during scanning.
    pub fn from_scan(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            btleplug::Error::NotSupported(_) => Self::AdapterUnavailable,
            other => Self::ScanFailed {
                code: scan_error_code(&other),
            },
        }
    }

    /// Map a btleplug failure while establishing a link.
    pub fn from_connect(error: btleplug::Error, address: &str) -> Self {
        match error {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            btleplug::Error::DeviceNotFound | btleplug::Error::InvalidBDAddr(_) => {
                Self::AddressInvalid {
                    address: address.to_string(),
                }
            }
            other => Self::ConnectionFailed {
                reason: other.to_string(),
            },
        }
    }
}

// Coarse codes so callers can tell failure classes apart in logs.
fn scan_error_code(error: &btleplug::Error) -> i32 {
    match error {
        btleplug::Error::NotConnected => 1,
        btleplug::Error::TimedOut(_) => 2,
        btleplug::Error::RuntimeError(_) => 3,
        _ => 4,
    }
}
