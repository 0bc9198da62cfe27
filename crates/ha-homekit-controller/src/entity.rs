//! Entities bound to accessory tree elements
//!
//! A [`HomeKitEntity`] pairs an [`EntityKey`] with the [`EntityBehavior`] a
//! factory built for it. On `added()` it resolves the characteristic types the
//! behavior asks for into keys, registers poll and event interest for them
//! and subscribes to value changes. `remove()` undoes all of that exactly once.

use ha_homekit_model::{
    AccessoryInfo, Characteristic, CharacteristicKey, CharacteristicRegistry, CharacteristicType,
    CharacteristicValue, CharacteristicWrite, EntityKey, Service,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

use crate::connection::{AccessoryConnection, WeakConnection};
use crate::dispatch::Platform;
use crate::error::{HomeKitError, HomeKitResult};
use crate::hub::{CharacteristicDelta, StateCallback, SubscriptionSet};

/// Domain behavior supplied by a factory
///
/// Hooks run on the hub's listener task or inside connection calls and must
/// not block.
pub trait EntityBehavior: Send + Sync {
    /// Characteristic types this entity reads or writes
    fn characteristic_types(&self) -> Vec<CharacteristicType>;

    fn platform(&self) -> Option<Platform> {
        None
    }

    /// Display name; falls back to the service name, then the accessory name
    fn name(&self, _entity: &HomeKitEntity) -> Option<String> {
        None
    }

    /// Values of tracked characteristics changed
    fn state_changed(&self, _entity: &HomeKitEntity, _delta: &CharacteristicDelta) {}

    /// The accessory structure was refreshed and the entity survived
    fn config_changed(&self, _entity: &HomeKitEntity) {}

    fn removed(&self, _key: EntityKey) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Bindings {
    characteristics: BTreeMap<CharacteristicType, CharacteristicKey>,
    pollable: Vec<CharacteristicKey>,
    watchable: Vec<CharacteristicKey>,
}

impl Bindings {
    fn resolve(registry: &CharacteristicRegistry, key: EntityKey, types: &[CharacteristicType]) -> Self {
        let mut characteristics = BTreeMap::new();
        let aid = key.aid();
        let mut bind = |characteristic: &Characteristic| {
            characteristics
                .entry(characteristic.kind())
                .or_insert_with(|| CharacteristicKey::new(aid, characteristic.iid));
        };

        match key {
            EntityKey::Accessory { aid } => {
                if let Some(accessory) = registry.accessory(aid) {
                    for kind in types {
                        if let Some(c) = accessory
                            .services
                            .iter()
                            .find_map(|s| s.characteristic_of_type(*kind))
                        {
                            bind(c);
                        }
                    }
                }
            }
            EntityKey::Service { aid, iid } => {
                if let Some(service) = registry.find_service(aid, iid) {
                    types
                        .iter()
                        .filter_map(|kind| service.characteristic_of_type(*kind))
                        .for_each(&mut bind);
                }
            }
            EntityKey::Characteristic { aid, sid, iid } => {
                if let Some(own) = registry.find(aid, iid) {
                    bind(own);
                }
                if let Some(service) = registry.find_service(aid, sid) {
                    types
                        .iter()
                        .filter_map(|kind| service.characteristic_of_type(*kind))
                        .for_each(&mut bind);
                }
            }
        }

        let interest = |pick: fn(&Characteristic) -> bool| -> Vec<CharacteristicKey> {
            characteristics
                .values()
                .filter(|key| registry.find(key.aid, key.iid).is_some_and(pick))
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };
        let pollable = interest(Characteristic::is_pollable);
        let watchable = interest(Characteristic::is_watchable);

        Self {
            characteristics,
            pollable,
            watchable,
        }
    }
}

/// An entity bound to one accessory, service or characteristic
pub struct HomeKitEntity {
    key: EntityKey,
    unique_id: String,
    behavior: Arc<dyn EntityBehavior>,
    connection: WeakConnection,
    bindings: RwLock<Bindings>,
    subscriptions: Mutex<SubscriptionSet>,
    removed: AtomicBool,
}

impl HomeKitEntity {
    pub(crate) fn new(
        connection: WeakConnection,
        pairing_id: &str,
        key: EntityKey,
        behavior: Arc<dyn EntityBehavior>,
    ) -> Self {
        Self {
            key,
            unique_id: format!("homekit-{}-{}", pairing_id, key),
            behavior,
            connection,
            bindings: RwLock::new(Bindings::default()),
            subscriptions: Mutex::new(SubscriptionSet::new()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    /// Stable across restarts: pairing id plus entity key
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn behavior(&self) -> &Arc<dyn EntityBehavior> {
        &self.behavior
    }

    pub fn platform(&self) -> Option<Platform> {
        self.behavior.platform()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn added(self: &Arc<Self>, conn: &AccessoryConnection) {
        let bindings = conn.with_registry(|registry| {
            Bindings::resolve(registry, self.key, &self.behavior.characteristic_types())
        });
        self.attach(conn, bindings);
    }

    fn attach(self: &Arc<Self>, conn: &AccessoryConnection, bindings: Bindings) {
        conn.add_pollable_characteristics(bindings.pollable.iter().copied());
        conn.add_watchable_characteristics(bindings.watchable.iter().copied());

        let entity = Arc::downgrade(self);
        let callback: StateCallback = Arc::new(move |delta: &CharacteristicDelta| {
            if let Some(entity) = entity.upgrade() {
                if !entity.is_removed() {
                    entity.behavior.state_changed(&entity, delta);
                }
            }
        });
        let subscription =
            conn.async_subscribe(bindings.characteristics.values().copied(), callback);
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription);

        *self.bindings.write().unwrap_or_else(PoisonError::into_inner) = bindings;
    }

    fn detach(&self, conn: Option<&AccessoryConnection>) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release_all();
        let bindings = std::mem::take(
            &mut *self.bindings.write().unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(conn) = conn {
            conn.remove_pollable_characteristics(bindings.pollable);
            conn.remove_watchable_characteristics(bindings.watchable);
        }
    }

    /// Rebind after a structure refresh
    ///
    /// Interest and subscriptions are only rebuilt when the resolved keys
    /// actually changed.
    pub(crate) fn config_changed(self: &Arc<Self>, conn: &AccessoryConnection) {
        if self.is_removed() {
            return;
        }
        let resolved = conn.with_registry(|registry| {
            Bindings::resolve(registry, self.key, &self.behavior.characteristic_types())
        });
        let unchanged = *self.bindings.read().unwrap_or_else(PoisonError::into_inner) == resolved;
        if !unchanged {
            debug!(key = %self.key, "Entity characteristics changed, rebinding");
            self.detach(Some(conn));
            self.attach(conn, resolved);
        }
        self.behavior.config_changed(self);
    }

    /// Release all interest and forget the entity; repeated calls do nothing
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.connection.upgrade();
        self.detach(conn.as_ref());
        if let Some(conn) = conn {
            conn.entity_key_removed(&self.key);
        }
        self.behavior.removed(self.key);
    }

    /// Whether any bound characteristic is in `keys`
    pub fn tracks_any(&self, keys: &BTreeSet<CharacteristicKey>) -> bool {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .characteristics
            .values()
            .any(|key| keys.contains(key))
    }

    /// Connection available and the bound element still exists
    pub fn available(&self) -> bool {
        if self.is_removed() {
            return false;
        }
        match self.connection.upgrade() {
            Some(conn) => {
                conn.available() && conn.with_registry(|r| r.contains_entity(&self.key))
            }
            None => false,
        }
    }

    pub fn characteristic_key(&self, kind: CharacteristicType) -> Option<CharacteristicKey> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .characteristics
            .get(&kind)
            .copied()
    }

    /// Every bound key; stable order
    pub fn characteristic_keys(&self) -> Vec<CharacteristicKey> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .characteristics
            .values()
            .copied()
            .collect()
    }

    pub fn pollable_keys(&self) -> Vec<CharacteristicKey> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pollable
            .clone()
    }

    pub fn watchable_keys(&self) -> Vec<CharacteristicKey> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .watchable
            .clone()
    }

    pub fn characteristic(&self, kind: CharacteristicType) -> Option<Characteristic> {
        let key = self.characteristic_key(kind)?;
        let conn = self.connection.upgrade()?;
        conn.with_registry(|r| r.find(key.aid, key.iid).cloned())
    }

    /// Last known value of a bound characteristic
    pub fn value(&self, kind: CharacteristicType) -> Option<CharacteristicValue> {
        let key = self.characteristic_key(kind)?;
        let conn = self.connection.upgrade()?;
        conn.with_registry(|r| r.value(&key).cloned())
    }

    /// Last known values of every bound characteristic, by type
    pub fn current_state(&self) -> BTreeMap<CharacteristicType, CharacteristicValue> {
        let Some(conn) = self.connection.upgrade() else {
            return BTreeMap::new();
        };
        let characteristics = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .characteristics
            .clone();
        conn.with_registry(|r| {
            characteristics
                .into_iter()
                .filter_map(|(kind, key)| r.value(&key).map(|v| (kind, v.clone())))
                .collect()
        })
    }

    /// The bound service, or the service owning the bound characteristic
    pub fn service(&self) -> Option<Service> {
        let service = self.key.service()?;
        let conn = self.connection.upgrade()?;
        conn.with_registry(|r| r.find_service(service.aid, service.iid).cloned())
    }

    pub fn accessory_info(&self) -> AccessoryInfo {
        self.connection
            .upgrade()
            .and_then(|conn| conn.accessory_info(self.key.aid()))
            .unwrap_or_default()
    }

    pub fn name(&self) -> Option<String> {
        if let Some(name) = self.behavior.name(self) {
            return Some(name);
        }
        let service_name = self
            .service()
            .and_then(|s| {
                s.characteristic_of_type(CharacteristicType::Name)
                    .and_then(|c| c.value())
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });
        service_name.or_else(|| self.accessory_info().name)
    }

    /// Write values by characteristic type
    ///
    /// Fails with [`HomeKitError::UnknownCharacteristicType`] before anything
    /// is sent if a type is not bound to this entity.
    pub async fn put_characteristics(
        &self,
        values: impl IntoIterator<Item = (CharacteristicType, CharacteristicValue)>,
    ) -> HomeKitResult<()> {
        let writes = values
            .into_iter()
            .map(|(kind, value)| {
                self.characteristic_key(kind)
                    .map(|key| CharacteristicWrite::new(key, value))
                    .ok_or(HomeKitError::UnknownCharacteristicType(kind))
            })
            .collect::<HomeKitResult<Vec<_>>>()?;

        let conn = self
            .connection
            .upgrade()
            .ok_or_else(|| HomeKitError::NotConnected(self.unique_id.clone()))?;
        conn.put_characteristics(writes).await
    }
}

impl fmt::Debug for HomeKitEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HomeKitEntity")
            .field("key", &self.key)
            .field("unique_id", &self.unique_id)
            .field("removed", &self.is_removed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_homekit_model::{Accessories, Accessory, Perm, ServiceType};

    fn tree() -> CharacteristicRegistry {
        CharacteristicRegistry::new(Accessories::new(vec![Accessory::new(1)
            .with_service(
                Service::new(7, ServiceType::Lightbulb)
                    .with_characteristic(Characteristic::new(
                        8,
                        CharacteristicType::On,
                        vec![Perm::PairedRead, Perm::PairedWrite, Perm::Events],
                    ))
                    .with_characteristic(Characteristic::new(
                        9,
                        CharacteristicType::Brightness,
                        vec![Perm::PairedRead, Perm::PairedWrite],
                    )),
            )
            .with_service(Service::new(20, ServiceType::Battery).with_characteristic(
                Characteristic::new(21, CharacteristicType::StatusLowBattery, vec![Perm::PairedRead]),
            ))]))
    }

    #[test]
    fn test_resolve_service_bindings() {
        let bindings = Bindings::resolve(
            &tree(),
            EntityKey::Service { aid: 1, iid: 7 },
            &[CharacteristicType::On, CharacteristicType::Brightness, CharacteristicType::Hue],
        );

        assert_eq!(bindings.characteristics.len(), 2);
        assert_eq!(
            bindings.characteristics[&CharacteristicType::On],
            CharacteristicKey::new(1, 8)
        );
        assert_eq!(bindings.pollable, vec![CharacteristicKey::new(1, 8), CharacteristicKey::new(1, 9)]);
        assert_eq!(bindings.watchable, vec![CharacteristicKey::new(1, 8)]);
    }

    #[test]
    fn test_resolve_accessory_bindings_search_all_services() {
        let bindings = Bindings::resolve(
            &tree(),
            EntityKey::Accessory { aid: 1 },
            &[CharacteristicType::StatusLowBattery],
        );
        assert_eq!(
            bindings.characteristics.get(&CharacteristicType::StatusLowBattery),
            Some(&CharacteristicKey::new(1, 21))
        );
    }

    #[test]
    fn test_resolve_characteristic_binds_itself() {
        let bindings = Bindings::resolve(
            &tree(),
            EntityKey::Characteristic { aid: 1, sid: 20, iid: 21 },
            &[],
        );
        assert_eq!(bindings.characteristics.len(), 1);
        assert_eq!(bindings.pollable, vec![CharacteristicKey::new(1, 21)]);
        assert!(bindings.watchable.is_empty());
    }

    #[test]
    fn test_resolve_missing_element() {
        let bindings = Bindings::resolve(
            &tree(),
            EntityKey::Service { aid: 2, iid: 7 },
            &[CharacteristicType::On],
        );
        assert_eq!(bindings, Bindings::default());
    }
}
