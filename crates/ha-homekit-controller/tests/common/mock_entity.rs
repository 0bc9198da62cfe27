//! Recording entity behavior for testing
//!
//! Captures every hook call so tests can assert on what an entity saw.

use ha_homekit_controller::{
    CharacteristicDelta, EntityBehavior, HomeKitEntity, Platform, ServiceContext, ServiceFactory,
};
use ha_homekit_model::{CharacteristicKey, CharacteristicType, EntityKey, ServiceType};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// An entity behavior that records its hook calls
pub struct RecordingBehavior {
    types: Vec<CharacteristicType>,
    platform: Option<Platform>,
    deltas: Mutex<Vec<CharacteristicDelta>>,
    config_changes: AtomicUsize,
    removed: Mutex<Vec<EntityKey>>,
}

impl RecordingBehavior {
    pub fn new(types: Vec<CharacteristicType>, platform: Option<Platform>) -> Arc<Self> {
        Arc::new(Self {
            types,
            platform,
            deltas: Mutex::new(Vec::new()),
            config_changes: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn deltas(&self) -> Vec<CharacteristicDelta> {
        self.deltas.lock().unwrap().clone()
    }

    /// Latest value seen for a key across all deltas
    pub fn last_value(&self, key: CharacteristicKey) -> Option<Value> {
        self.deltas
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|delta| delta.get(&key).cloned())
    }

    pub fn config_changes(&self) -> usize {
        self.config_changes.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<EntityKey> {
        self.removed.lock().unwrap().clone()
    }
}

impl EntityBehavior for RecordingBehavior {
    fn characteristic_types(&self) -> Vec<CharacteristicType> {
        self.types.clone()
    }

    fn platform(&self) -> Option<Platform> {
        self.platform
    }

    fn state_changed(&self, _entity: &HomeKitEntity, delta: &CharacteristicDelta) {
        self.deltas.lock().unwrap().push(delta.clone());
    }

    fn config_changed(&self, _entity: &HomeKitEntity) {
        self.config_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn removed(&self, key: EntityKey) {
        self.removed.lock().unwrap().push(key);
    }
}

/// Builds a [`RecordingBehavior`] for every lightbulb service and keeps them
#[derive(Clone, Default)]
pub struct LightFactory {
    built: Arc<Mutex<Vec<Arc<RecordingBehavior>>>>,
}

impl LightFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> ServiceFactory {
        let built = self.built.clone();
        Arc::new(move |ctx: &ServiceContext<'_>| {
            if ctx.service.kind() != ServiceType::Lightbulb {
                return None;
            }
            let behavior = RecordingBehavior::new(
                vec![CharacteristicType::On, CharacteristicType::Brightness],
                Some(Platform::Light),
            );
            built.lock().unwrap().push(behavior.clone());
            Some(behavior as Arc<dyn EntityBehavior>)
        })
    }

    pub fn built(&self) -> Vec<Arc<RecordingBehavior>> {
        self.built.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<RecordingBehavior> {
        self.built.lock().unwrap().last().cloned().unwrap()
    }
}
