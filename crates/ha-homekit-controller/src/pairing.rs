//! Pairing transport capability
//!
//! The HAP session itself (pair-verify, encrypted HTTP or BLE framing) lives
//! outside this crate. The controller only needs the operations below.

use async_trait::async_trait;
use ha_homekit_model::{
    AccessoriesState, CharacteristicKey, CharacteristicRead, CharacteristicWrite, HapStatus,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::HomeKitResult;

/// Credentials for one pairing, persisted by the host and never interpreted here
pub type PairingData = Map<String, Value>;

/// An authenticated session with one accessory or bridge
///
/// Implementations need not be safe for concurrent requests; the connection
/// serializes every call.
#[async_trait]
pub trait Pairing: Send + Sync {
    fn pairing_id(&self) -> &str;

    /// Open or verify the session
    async fn connect(&self) -> HomeKitResult<()> {
        Ok(())
    }

    async fn list_accessories_and_characteristics(&self) -> HomeKitResult<AccessoriesState>;

    async fn get_characteristics(
        &self,
        keys: &[CharacteristicKey],
    ) -> HomeKitResult<HashMap<CharacteristicKey, CharacteristicRead>>;

    /// Write values; the result holds one status per write, omitted on success
    async fn put_characteristics(
        &self,
        writes: &[CharacteristicWrite],
    ) -> HomeKitResult<HashMap<CharacteristicKey, HapStatus>>;

    /// Ask the accessory to push events for these keys
    async fn subscribe(&self, keys: &[CharacteristicKey]) -> HomeKitResult<()>;

    async fn unsubscribe(&self, keys: &[CharacteristicKey]) -> HomeKitResult<()>;

    /// Whether the transport currently believes the accessory is reachable
    fn is_available(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> HomeKitResult<()> {
        Ok(())
    }
}

/// Creates pairings from stored credentials
pub trait Controller: Send + Sync {
    fn load_pairing(
        &self,
        pairing_id: &str,
        data: &PairingData,
    ) -> HomeKitResult<Arc<dyn Pairing>>;
}
