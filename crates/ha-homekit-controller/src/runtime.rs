//! Controller runtime
//!
//! Owns the entity map cache and one [`AccessoryConnection`] per pairing.
//! The host drives it with setup, discovery updates and unload calls.

use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::HomeKitControllerConfig;
use crate::connection::AccessoryConnection;
use crate::entity_map::EntityMapCache;
use crate::error::HomeKitResult;
use crate::pairing::{Controller, PairingData};

/// All connections of one controller instance
pub struct HomeKitRuntime {
    config: HomeKitControllerConfig,
    cache: EntityMapCache,
    controller: Arc<dyn Controller>,
    devices: DashMap<String, AccessoryConnection>,
}

impl HomeKitRuntime {
    /// Load the entity map cache and create an empty runtime
    ///
    /// The cache is fully loaded before this returns, so the first
    /// connection can already hit it.
    pub async fn start(
        config_dir: impl AsRef<Path>,
        config: HomeKitControllerConfig,
        controller: Arc<dyn Controller>,
    ) -> HomeKitResult<Self> {
        config.validate()?;
        let cache = EntityMapCache::load(config_dir, config.entity_map_save_delay()).await;
        info!(cached = cache.len(), "HomeKit controller started");

        Ok(Self {
            config,
            cache,
            controller,
            devices: DashMap::new(),
        })
    }

    pub fn config(&self) -> &HomeKitControllerConfig {
        &self.config
    }

    pub fn cache(&self) -> &EntityMapCache {
        &self.cache
    }

    /// Load a pairing from stored credentials and connect it
    ///
    /// The connection is registered even when setup is still retrying, so
    /// discovery updates and unload reach it.
    #[instrument(skip(self, data))]
    pub async fn async_setup_pairing(
        &self,
        pairing_id: &str,
        data: &PairingData,
    ) -> HomeKitResult<AccessoryConnection> {
        if let Some(existing) = self.connection(pairing_id) {
            existing.connect().await?;
            return Ok(existing);
        }

        let pairing = self.controller.load_pairing(pairing_id, data)?;
        let conn = AccessoryConnection::new(pairing, self.cache.clone(), self.config.clone());
        self.devices.insert(pairing_id.to_string(), conn.clone());

        conn.connect().await?;
        Ok(conn)
    }

    pub fn connection(&self, pairing_id: &str) -> Option<AccessoryConnection> {
        self.devices.get(pairing_id).map(|c| c.value().clone())
    }

    pub fn pairing_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Discovery reported a config number for a pairing
    ///
    /// Returns `true` if a structure refresh ran.
    pub async fn async_config_num_changed(
        &self,
        pairing_id: &str,
        config_num: u64,
    ) -> HomeKitResult<bool> {
        match self.connection(pairing_id) {
            Some(conn) => conn.refresh_if_config_changed(config_num).await,
            None => {
                // Not set up yet: a stale cache record would only be loaded
                // and immediately refetched
                if self
                    .cache
                    .get(pairing_id)
                    .is_some_and(|record| record.config_num != config_num)
                {
                    self.cache.delete(pairing_id);
                }
                Ok(false)
            }
        }
    }

    /// Stop a connection and forget it; the cache record is kept
    #[instrument(skip(self))]
    pub async fn async_unload(&self, pairing_id: &str) -> bool {
        let Some(conn) = self.connection(pairing_id) else {
            return false;
        };
        conn.unload().await;
        self.devices.remove(pairing_id);
        true
    }

    /// Unload a pairing and drop its cached structure
    #[instrument(skip(self))]
    pub async fn async_remove_pairing(&self, pairing_id: &str) {
        self.async_unload(pairing_id).await;
        self.cache.delete(pairing_id);
        info!(pairing_id, "Pairing removed");
    }

    /// Unload every connection and write the cache out
    pub async fn async_shutdown(&self) {
        let connections: Vec<AccessoryConnection> =
            self.devices.iter().map(|c| c.value().clone()).collect();
        futures::future::join_all(connections.iter().map(|conn| conn.unload())).await;
        self.devices.clear();

        self.cache.flush().await;
        info!("HomeKit controller stopped");
    }
}
