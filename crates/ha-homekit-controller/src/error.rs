//! Error taxonomy for the HomeKit controller

use ha_homekit_model::{CharacteristicType, HapStatus};
use thiserror::Error;

use crate::config::ConfigError;
use crate::state::InvalidTransition;
use crate::storage::StorageError;

/// Result type for controller operations
pub type HomeKitResult<T> = Result<T, HomeKitError>;

/// Errors raised by the controller or surfaced from the pairing transport
#[derive(Debug, Error)]
pub enum HomeKitError {
    /// The accessory is not reachable at its last known address
    #[error("accessory not found: {0}")]
    AccessoryNotFound(String),

    /// The session dropped mid-request
    #[error("accessory disconnected: {0}")]
    AccessoryDisconnected(String),

    /// Session encryption failed; usually a stale session key
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Pairing credentials were rejected; the user must re-pair
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("request timed out")]
    Timeout,

    /// The accessory rejected a characteristic write
    #[error("write to {aid}.{iid} failed: {status}")]
    WriteFailed { aid: u64, iid: u64, status: HapStatus },

    #[error("unknown characteristic {aid}.{iid}")]
    UnknownCharacteristic { aid: u64, iid: u64 },

    /// An entity asked for a type it never declared
    #[error("entity has no characteristic of type {0}")]
    UnknownCharacteristicType(CharacteristicType),

    #[error("connection {0} is not ready")]
    NotConnected(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl HomeKitError {
    /// Communication failures that a later attempt may resolve
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HomeKitError::AccessoryNotFound(_)
                | HomeKitError::AccessoryDisconnected(_)
                | HomeKitError::Encryption(_)
                | HomeKitError::Timeout
        )
    }

    /// Failures that require the user to pair again
    pub fn is_authentication(&self) -> bool {
        matches!(self, HomeKitError::Authentication(_))
    }
}
