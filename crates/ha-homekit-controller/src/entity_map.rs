//! Entity map cache
//!
//! Remembers the accessory tree of every pairing, keyed by pairing id, so a
//! restart can skip the structure fetch when the config number is unchanged.
//! Writes are coalesced: any number of `put`/`delete` calls inside one
//! save-delay window produce a single file write.

use dashmap::DashMap;
use ha_homekit_model::Accessories;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::storage::{Storable, Store};

/// Storage key for the entity map file
pub const ENTITY_MAP_KEY: &str = "homekit_controller-entity-map";

/// The cached structure of one pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMapRecord {
    /// Stored as the map key, not inside the record
    #[serde(skip)]
    pub pairing_id: String,
    pub config_num: u64,
    pub accessories: Accessories,
}

/// On-disk layout; loading reads records as raw JSON so each one decodes
/// on its own
#[derive(Debug, Serialize, Deserialize)]
struct EntityMapData<R = EntityMapRecord> {
    #[serde(default = "BTreeMap::new")]
    pairings: BTreeMap<String, R>,
}

impl<R> Default for EntityMapData<R> {
    fn default() -> Self {
        Self {
            pairings: BTreeMap::new(),
        }
    }
}

impl<R: Serialize + DeserializeOwned> Storable for EntityMapData<R> {
    const KEY: &'static str = ENTITY_MAP_KEY;
    const VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 1;
}

struct Inner {
    store: Store<EntityMapData>,
    records: DashMap<String, EntityMapRecord>,
    save_delay: Duration,
    flush_pending: AtomicBool,
    write_lock: Mutex<()>,
}

/// Persisted pairing id → structure snapshot
#[derive(Clone)]
pub struct EntityMapCache {
    inner: Arc<Inner>,
}

impl EntityMapCache {
    /// Load the cache from `config_dir`
    ///
    /// An unreadable file is logged and treated as empty, and an unreadable
    /// record is skipped without affecting the others; startup never fails
    /// because of the cache.
    pub async fn load(config_dir: impl AsRef<Path>, save_delay: Duration) -> Self {
        let raw: Store<EntityMapData<serde_json::Value>> = Store::new(config_dir.as_ref());
        let store: Store<EntityMapData> = Store::new(config_dir);

        let data = match raw.load().await {
            Ok(data) => data.unwrap_or_default(),
            Err(e) => {
                warn!(path = ?store.path(), "Discarding unreadable entity map: {}", e);
                EntityMapData::default()
            }
        };

        let records = DashMap::new();
        for (pairing_id, value) in data.pairings {
            match serde_json::from_value::<EntityMapRecord>(value) {
                Ok(mut record) => {
                    record.pairing_id = pairing_id.clone();
                    records.insert(pairing_id, record);
                }
                Err(e) => {
                    warn!(%pairing_id, "Discarding unreadable cached entity map: {}", e);
                }
            }
        }
        debug!("Loaded {} cached entity maps", records.len());

        Self {
            inner: Arc::new(Inner {
                store,
                records,
                save_delay,
                flush_pending: AtomicBool::new(false),
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn get(&self, pairing_id: &str) -> Option<EntityMapRecord> {
        self.inner.records.get(pairing_id).map(|r| r.clone())
    }

    /// Replace the record for a pairing and schedule a flush
    pub fn put(
        &self,
        pairing_id: &str,
        config_num: u64,
        accessories: Accessories,
    ) -> EntityMapRecord {
        let record = EntityMapRecord {
            pairing_id: pairing_id.to_string(),
            config_num,
            accessories,
        };
        self.inner
            .records
            .insert(pairing_id.to_string(), record.clone());
        debug!(pairing_id, config_num, "Updated cached entity map");
        self.schedule_flush();
        record
    }

    pub fn delete(&self, pairing_id: &str) {
        if self.inner.records.remove(pairing_id).is_some() {
            debug!(pairing_id, "Removed cached entity map");
            self.schedule_flush();
        }
    }

    pub fn contains(&self, pairing_id: &str) -> bool {
        self.inner.records.contains_key(pairing_id)
    }

    pub fn pairing_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Whether a debounced write is waiting to run
    pub fn flush_pending(&self) -> bool {
        self.inner.flush_pending.load(Ordering::Acquire)
    }

    /// Write the current records now; an empty cache removes the file
    ///
    /// Failures are logged; the in-memory records stay authoritative and the
    /// next change schedules another attempt.
    pub async fn flush(&self) {
        let _guard = self.inner.write_lock.lock().await;
        self.inner.flush_pending.store(false, Ordering::Release);

        let data: EntityMapData = EntityMapData {
            pairings: self
                .inner
                .records
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect(),
        };

        let result = if data.pairings.is_empty() {
            self.inner.store.remove().await
        } else {
            self.inner.store.save(&data).await
        };
        if let Err(e) = result {
            warn!("Failed to save entity map: {}", e);
        }
    }

    fn schedule_flush(&self) {
        if self.inner.flush_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to schedule entity map save; call flush() explicitly");
            return;
        };

        let cache = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(cache.inner.save_delay).await;
            if cache.flush_pending() {
                cache.flush().await;
            }
        });
    }
}

impl std::fmt::Debug for EntityMapCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMapCache")
            .field("path", &self.inner.store.path())
            .field("records", &self.inner.records.len())
            .finish()
    }
}
