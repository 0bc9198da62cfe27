//! Entity factory dispatch
//!
//! Factories are tried in registration order against every accessory,
//! service and characteristic of the tree. The first factory to return a
//! behavior claims that element's [`EntityKey`]; later factories never see a
//! claimed key until the entity bound to it is removed and the claim
//! released. Elements no factory claims are simply skipped.

use ha_homekit_model::{
    Accessory, Characteristic, CharacteristicRegistry, CharacteristicType, EntityKey, Service,
    ServiceType,
};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::entity::EntityBehavior;

/// What a factory returns when it claims an element
pub type Built = Option<Arc<dyn EntityBehavior>>;

/// Matches whole accessories
pub type AccessoryFactory = Arc<dyn Fn(&Accessory) -> Built + Send + Sync>;

/// Matches services
pub type ServiceFactory = Arc<dyn Fn(&ServiceContext<'_>) -> Built + Send + Sync>;

/// Matches individual characteristics
pub type CharacteristicFactory = Arc<dyn Fn(&CharacteristicContext<'_>) -> Built + Send + Sync>;

/// A service together with the accessory that owns it
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    pub accessory: &'a Accessory,
    pub service: &'a Service,
}

/// A characteristic together with its service and accessory
#[derive(Debug, Clone, Copy)]
pub struct CharacteristicContext<'a> {
    pub accessory: &'a Accessory,
    pub service: &'a Service,
    pub characteristic: &'a Characteristic,
}

/// A newly claimed element and the behavior built for it
#[derive(Clone)]
pub struct Claim {
    pub key: EntityKey,
    pub behavior: Arc<dyn EntityBehavior>,
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim").field("key", &self.key).finish()
    }
}

/// Ordered factory lists plus the set of claimed entity keys
#[derive(Default)]
pub struct EntityFactoryDispatch {
    listeners: Vec<ServiceFactory>,
    accessory_factories: Vec<AccessoryFactory>,
    char_factories: Vec<CharacteristicFactory>,
    claimed: HashSet<EntityKey>,
}

impl EntityFactoryDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service factory and replay it over `registry`
    pub fn add_listener(
        &mut self,
        factory: ServiceFactory,
        registry: &CharacteristicRegistry,
    ) -> Vec<Claim> {
        self.listeners.push(factory.clone());
        self.match_services(registry, &[factory])
    }

    /// Register an accessory factory and replay it over `registry`
    pub fn add_accessory_factory(
        &mut self,
        factory: AccessoryFactory,
        registry: &CharacteristicRegistry,
    ) -> Vec<Claim> {
        self.accessory_factories.push(factory.clone());
        self.match_accessories(registry, &[factory])
    }

    /// Register a characteristic factory and replay it over `registry`
    pub fn add_char_factory(
        &mut self,
        factory: CharacteristicFactory,
        registry: &CharacteristicRegistry,
    ) -> Vec<Claim> {
        self.char_factories.push(factory.clone());
        self.match_characteristics(registry, &[factory])
    }

    /// Run every factory over the tree
    ///
    /// Service listeners go first, then accessory factories, then
    /// characteristic factories. Already claimed keys are skipped, so a pass
    /// over an unchanged tree claims nothing.
    pub fn run(&mut self, registry: &CharacteristicRegistry) -> Vec<Claim> {
        let listeners = self.listeners.clone();
        let accessory_factories = self.accessory_factories.clone();
        let char_factories = self.char_factories.clone();

        let mut claims = self.match_services(registry, &listeners);
        claims.extend(self.match_accessories(registry, &accessory_factories));
        claims.extend(self.match_characteristics(registry, &char_factories));
        claims
    }

    fn match_services(
        &mut self,
        registry: &CharacteristicRegistry,
        factories: &[ServiceFactory],
    ) -> Vec<Claim> {
        let mut claims = Vec::new();
        for accessory in registry.accessories() {
            for service in &accessory.services {
                let key = EntityKey::Service {
                    aid: accessory.aid,
                    iid: service.iid,
                };
                if self.claimed.contains(&key) {
                    continue;
                }
                let ctx = ServiceContext { accessory, service };
                if let Some(behavior) = factories.iter().find_map(|factory| factory(&ctx)) {
                    claims.push(self.claim(key, behavior));
                }
            }
        }
        claims
    }

    fn match_accessories(
        &mut self,
        registry: &CharacteristicRegistry,
        factories: &[AccessoryFactory],
    ) -> Vec<Claim> {
        let mut claims = Vec::new();
        for accessory in registry.accessories() {
            let key = EntityKey::Accessory { aid: accessory.aid };
            if self.claimed.contains(&key) {
                continue;
            }
            if let Some(behavior) = factories.iter().find_map(|factory| factory(accessory)) {
                claims.push(self.claim(key, behavior));
            }
        }
        claims
    }

    fn match_characteristics(
        &mut self,
        registry: &CharacteristicRegistry,
        factories: &[CharacteristicFactory],
    ) -> Vec<Claim> {
        let mut claims = Vec::new();
        for accessory in registry.accessories() {
            for service in &accessory.services {
                for characteristic in &service.characteristics {
                    let key = EntityKey::Characteristic {
                        aid: accessory.aid,
                        sid: service.iid,
                        iid: characteristic.iid,
                    };
                    if self.claimed.contains(&key) {
                        continue;
                    }
                    let ctx = CharacteristicContext {
                        accessory,
                        service,
                        characteristic,
                    };
                    if let Some(behavior) = factories.iter().find_map(|factory| factory(&ctx)) {
                        claims.push(self.claim(key, behavior));
                    }
                }
            }
        }
        claims
    }

    fn claim(&mut self, key: EntityKey, behavior: Arc<dyn EntityBehavior>) -> Claim {
        trace!(%key, "Entity key claimed");
        self.claimed.insert(key);
        Claim { key, behavior }
    }

    /// Release a claim so a later pass may build the element again
    pub fn release(&mut self, key: &EntityKey) -> bool {
        self.claimed.remove(key)
    }

    pub fn is_claimed(&self, key: &EntityKey) -> bool {
        self.claimed.contains(key)
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.len()
    }

    pub fn factory_count(&self) -> usize {
        self.listeners.len() + self.accessory_factories.len() + self.char_factories.len()
    }

    /// Forget every claim; factories stay registered
    pub fn clear_claims(&mut self) {
        self.claimed.clear();
    }
}

/// Host platforms an entity can belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    BinarySensor,
    Button,
    Climate,
    Cover,
    Event,
    Fan,
    Light,
    Lock,
    Sensor,
    Switch,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::BinarySensor => "binary_sensor",
            Platform::Button => "button",
            Platform::Climate => "climate",
            Platform::Cover => "cover",
            Platform::Event => "event",
            Platform::Fan => "fan",
            Platform::Light => "light",
            Platform::Lock => "lock",
            Platform::Sensor => "sensor",
            Platform::Switch => "switch",
        }
    }

    /// Platform that handles a whole service of this type
    pub fn for_service(kind: ServiceType) -> Option<Platform> {
        match kind {
            ServiceType::Lightbulb => Some(Platform::Light),
            ServiceType::Switch | ServiceType::Outlet => Some(Platform::Switch),
            ServiceType::Fan => Some(Platform::Fan),
            ServiceType::Thermostat => Some(Platform::Climate),
            ServiceType::LockMechanism => Some(Platform::Lock),
            ServiceType::GarageDoorOpener => Some(Platform::Cover),
            ServiceType::TemperatureSensor
            | ServiceType::HumiditySensor
            | ServiceType::Battery => Some(Platform::Sensor),
            ServiceType::ContactSensor | ServiceType::MotionSensor => Some(Platform::BinarySensor),
            ServiceType::StatelessProgrammableSwitch | ServiceType::Doorbell => {
                Some(Platform::Event)
            }
            _ => None,
        }
    }

    /// Platform that handles a standalone characteristic of this type
    pub fn for_characteristic(kind: CharacteristicType) -> Option<Platform> {
        match kind {
            CharacteristicType::Identify => Some(Platform::Button),
            CharacteristicType::StatusLowBattery => Some(Platform::BinarySensor),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
