//! Characteristic registry
//!
//! An indexed view of one accessory tree. The registry is rebuilt from
//! scratch whenever the structure is refetched; the only in-place mutation
//! is [`CharacteristicRegistry::apply_values`], which records new values as
//! polls and events arrive.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{trace, warn};

use crate::model::{
    Accessories, Accessory, Characteristic, CharacteristicKey, EntityKey, Service, ServiceKey,
};
use crate::types::{CharacteristicType, ServiceType};

#[derive(Debug, Clone, Copy)]
struct CharPosition {
    accessory: usize,
    service: usize,
    characteristic: usize,
}

/// Indexed accessories → services → characteristics
#[derive(Debug, Clone, Default)]
pub struct CharacteristicRegistry {
    accessories: Accessories,
    /// aid -> accessory position
    accessory_index: HashMap<u64, usize>,
    /// (aid, iid) -> (accessory position, service position)
    service_index: HashMap<ServiceKey, (usize, usize)>,
    /// (aid, iid) -> full position of the characteristic
    characteristic_index: HashMap<CharacteristicKey, CharPosition>,
}

impl CharacteristicRegistry {
    /// Index a raw accessory tree
    ///
    /// Duplicate aids or iids are a device bug; the first occurrence wins and
    /// later ones are skipped with a warning.
    pub fn new(accessories: Accessories) -> Self {
        let mut accessory_index = HashMap::new();
        let mut service_index = HashMap::new();
        let mut characteristic_index = HashMap::new();

        for (a_pos, accessory) in accessories.iter().enumerate() {
            if accessory_index.contains_key(&accessory.aid) {
                warn!(aid = accessory.aid, "Duplicate accessory id, ignoring");
                continue;
            }
            accessory_index.insert(accessory.aid, a_pos);

            for (s_pos, service) in accessory.services.iter().enumerate() {
                let key = ServiceKey::new(accessory.aid, service.iid);
                if service_index.contains_key(&key) {
                    warn!(aid = key.aid, iid = key.iid, "Duplicate service iid, ignoring");
                    continue;
                }
                service_index.insert(key, (a_pos, s_pos));

                for (c_pos, characteristic) in service.characteristics.iter().enumerate() {
                    let key = CharacteristicKey::new(accessory.aid, characteristic.iid);
                    if characteristic_index.contains_key(&key) {
                        warn!(
                            aid = key.aid,
                            iid = key.iid,
                            "Duplicate characteristic iid, ignoring"
                        );
                        continue;
                    }
                    characteristic_index.insert(
                        key,
                        CharPosition {
                            accessory: a_pos,
                            service: s_pos,
                            characteristic: c_pos,
                        },
                    );
                }
            }
        }

        Self {
            accessories,
            accessory_index,
            service_index,
            characteristic_index,
        }
    }

    /// The underlying tree, including the latest applied values
    pub fn accessories(&self) -> &Accessories {
        &self.accessories
    }

    pub fn into_accessories(self) -> Accessories {
        self.accessories
    }

    pub fn accessory(&self, aid: u64) -> Option<&Accessory> {
        self.accessory_index
            .get(&aid)
            .map(|&pos| &self.accessories.0[pos])
    }

    /// Look up a characteristic by `(aid, iid)`
    pub fn find(&self, aid: u64, iid: u64) -> Option<&Characteristic> {
        self.characteristic_index
            .get(&CharacteristicKey::new(aid, iid))
            .map(|pos| self.at(*pos))
    }

    /// Look up a service by `(aid, iid)`
    pub fn find_service(&self, aid: u64, iid: u64) -> Option<&Service> {
        self.service_index
            .get(&ServiceKey::new(aid, iid))
            .map(|&(a, s)| &self.accessories.0[a].services[s])
    }

    /// The service owning a characteristic
    pub fn service_of(&self, key: CharacteristicKey) -> Option<(ServiceKey, &Service)> {
        self.characteristic_index.get(&key).map(|pos| {
            let service = &self.accessories.0[pos.accessory].services[pos.service];
            (ServiceKey::new(key.aid, service.iid), service)
        })
    }

    pub fn contains(&self, key: &CharacteristicKey) -> bool {
        self.characteristic_index.contains_key(key)
    }

    /// Whether the structural element behind an entity key still exists
    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        match *key {
            EntityKey::Accessory { aid } => self.accessory_index.contains_key(&aid),
            EntityKey::Service { aid, iid } => {
                self.service_index.contains_key(&ServiceKey::new(aid, iid))
            }
            EntityKey::Characteristic { aid, sid, iid } => self
                .service_of(CharacteristicKey::new(aid, iid))
                .is_some_and(|(service, _)| service.iid == sid),
        }
    }

    /// Every characteristic of the given type across all accessories
    pub fn characteristics_of_type(
        &self,
        kind: CharacteristicType,
    ) -> impl Iterator<Item = (CharacteristicKey, &Characteristic)> + '_ {
        self.accessories.iter().flat_map(move |accessory| {
            accessory
                .services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .filter(move |c| c.kind() == kind)
                .map(move |c| (CharacteristicKey::new(accessory.aid, c.iid), c))
        })
    }

    /// Every service of the given type across all accessories
    pub fn services_of_type(
        &self,
        kind: ServiceType,
    ) -> impl Iterator<Item = (ServiceKey, &Service)> + '_ {
        self.accessories.iter().flat_map(move |accessory| {
            accessory
                .services
                .iter()
                .filter(move |s| s.kind() == kind)
                .map(move |s| (ServiceKey::new(accessory.aid, s.iid), s))
        })
    }

    /// Last known value of a characteristic
    pub fn value(&self, key: &CharacteristicKey) -> Option<&Value> {
        self.characteristic_index
            .get(key)
            .and_then(|pos| self.at(*pos).value())
    }

    /// Last known values for a set of keys; unknown or empty keys are omitted
    pub fn current_state<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a CharacteristicKey>,
    ) -> HashMap<CharacteristicKey, Value> {
        keys.into_iter()
            .filter_map(|key| self.value(key).map(|v| (*key, v.clone())))
            .collect()
    }

    /// Record new values and return the ones that actually changed
    ///
    /// Event-only characteristics are always reported: two identical button
    /// presses are still two presses.
    pub fn apply_values(
        &mut self,
        values: impl IntoIterator<Item = (CharacteristicKey, Value)>,
    ) -> BTreeMap<CharacteristicKey, Value> {
        let mut changed = BTreeMap::new();

        for (key, value) in values {
            let Some(pos) = self.characteristic_index.get(&key).copied() else {
                trace!(%key, "Value for unknown characteristic, ignoring");
                continue;
            };

            let characteristic = &mut self.accessories.0[pos.accessory].services[pos.service]
                .characteristics[pos.characteristic];

            let is_new = characteristic.kind().is_event_only()
                || characteristic.value.as_ref() != Some(&value);

            if is_new {
                characteristic.value = Some(value.clone());
                changed.insert(key, value);
            }
        }

        changed
    }

    /// Every entity key the tree can back
    pub fn entity_keys(&self) -> BTreeSet<EntityKey> {
        let mut keys = BTreeSet::new();
        for accessory in &self.accessories {
            keys.insert(EntityKey::Accessory { aid: accessory.aid });
            for service in &accessory.services {
                keys.insert(EntityKey::Service {
                    aid: accessory.aid,
                    iid: service.iid,
                });
                for characteristic in &service.characteristics {
                    keys.insert(EntityKey::Characteristic {
                        aid: accessory.aid,
                        sid: service.iid,
                        iid: characteristic.iid,
                    });
                }
            }
        }
        keys
    }

    pub fn characteristic_count(&self) -> usize {
        self.characteristic_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessory_index.is_empty()
    }

    /// Structural difference from `self` (old) to `other` (new)
    ///
    /// Identity is by aid/iid and type. Characteristics inside an added or
    /// removed service or accessory are listed as added or removed too.
    pub fn diff(&self, other: &CharacteristicRegistry) -> RegistryDiff {
        let mut diff = RegistryDiff::default();

        for aid in self.accessory_index.keys() {
            if !other.accessory_index.contains_key(aid) {
                diff.removed_accessories.insert(*aid);
            }
        }
        for aid in other.accessory_index.keys() {
            if !self.accessory_index.contains_key(aid) {
                diff.added_accessories.insert(*aid);
            }
        }

        for (key, &(a, s)) in &self.service_index {
            let old = &self.accessories.0[a].services[s];
            match other.find_service(key.aid, key.iid) {
                Some(new) if old.same_identity(new) => {}
                _ => {
                    diff.removed_services.insert(*key);
                }
            }
        }
        for (key, &(a, s)) in &other.service_index {
            let new = &other.accessories.0[a].services[s];
            match self.find_service(key.aid, key.iid) {
                Some(old) if old.same_identity(new) => {}
                _ => {
                    diff.added_services.insert(*key);
                }
            }
        }

        for (key, pos) in &self.characteristic_index {
            let old = self.at(*pos);
            let old_sid = self.accessories.0[pos.accessory].services[pos.service].iid;
            let parent_gone = diff
                .removed_services
                .contains(&ServiceKey::new(key.aid, old_sid));

            match other.characteristic_index.get(key) {
                Some(new_pos) => {
                    let new = other.at(*new_pos);
                    let new_sid = other.accessories.0[new_pos.accessory].services
                        [new_pos.service]
                        .iid;
                    if parent_gone || old_sid != new_sid || old.kind() != new.kind() {
                        diff.removed_characteristics.insert(*key);
                        diff.added_characteristics.insert(*key);
                    } else if !old.same_metadata(new) {
                        diff.changed_characteristics.insert(*key);
                    }
                }
                None => {
                    diff.removed_characteristics.insert(*key);
                }
            }
        }
        for key in other.characteristic_index.keys() {
            if !self.characteristic_index.contains_key(key) {
                diff.added_characteristics.insert(*key);
            }
        }

        diff
    }

    fn at(&self, pos: CharPosition) -> &Characteristic {
        &self.accessories.0[pos.accessory].services[pos.service].characteristics
            [pos.characteristic]
    }
}

impl From<Accessories> for CharacteristicRegistry {
    fn from(accessories: Accessories) -> Self {
        Self::new(accessories)
    }
}

/// Result of [`CharacteristicRegistry::diff`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added_accessories: BTreeSet<u64>,
    pub removed_accessories: BTreeSet<u64>,
    pub added_services: BTreeSet<ServiceKey>,
    pub removed_services: BTreeSet<ServiceKey>,
    pub added_characteristics: BTreeSet<CharacteristicKey>,
    pub removed_characteristics: BTreeSet<CharacteristicKey>,
    /// Same identity, different metadata: reconfigure, don't recreate
    pub changed_characteristics: BTreeSet<CharacteristicKey>,
}

impl RegistryDiff {
    /// No structural or metadata change at all
    pub fn is_empty(&self) -> bool {
        !self.has_additions() && !self.has_removals() && self.changed_characteristics.is_empty()
    }

    pub fn has_additions(&self) -> bool {
        !self.added_accessories.is_empty()
            || !self.added_services.is_empty()
            || !self.added_characteristics.is_empty()
    }

    pub fn has_removals(&self) -> bool {
        !self.removed_accessories.is_empty()
            || !self.removed_services.is_empty()
            || !self.removed_characteristics.is_empty()
    }

    /// Whether the element behind an entity key was removed
    pub fn removes(&self, key: &EntityKey) -> bool {
        match *key {
            EntityKey::Accessory { aid } => self.removed_accessories.contains(&aid),
            EntityKey::Service { aid, iid } => {
                self.removed_accessories.contains(&aid)
                    || self.removed_services.contains(&ServiceKey::new(aid, iid))
            }
            EntityKey::Characteristic { aid, sid, iid } => {
                self.removed_accessories.contains(&aid)
                    || self.removed_services.contains(&ServiceKey::new(aid, sid))
                    || self
                        .removed_characteristics
                        .contains(&CharacteristicKey::new(aid, iid))
            }
        }
    }
}
