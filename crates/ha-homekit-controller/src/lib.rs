//! HomeKit Controller
//!
//! This crate keeps Home Assistant entities in sync with paired HomeKit
//! accessories. The HAP transport itself is supplied by the host through the
//! [`Pairing`] and [`Controller`] traits.
//!
//! # Key Types
//!
//! - [`HomeKitRuntime`] - All connections plus the shared entity map cache
//! - [`AccessoryConnection`] - Lifecycle, polling and events for one pairing
//! - [`EntityMapCache`] - Persisted accessory trees keyed by pairing id
//! - [`SubscriptionHub`] - Poll/event interest and value fan-out
//! - [`EntityFactoryDispatch`] - Factories that turn tree elements into entities
//!
//! # Storage
//!
//! Accessory trees are persisted in `.storage/homekit_controller-entity-map`
//! and reused on restart while the accessory's config number is unchanged.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod entity;
pub mod entity_map;
pub mod error;
pub mod hub;
pub mod pairing;
pub mod runtime;
pub mod state;
pub mod storage;

// Re-export main types
pub use config::{ConfigError, ConfigResult, HomeKitControllerConfig, CONFIG_SECTION};
pub use connection::{
    valid_serial_number, AccessoryConnection, ConnectionDiagnostics, EntityEvent, PollOutcome,
    WeakConnection,
};
pub use dispatch::{
    AccessoryFactory, CharacteristicContext, CharacteristicFactory, Claim,
    EntityFactoryDispatch, Platform, ServiceContext, ServiceFactory,
};
pub use entity::{EntityBehavior, HomeKitEntity};
pub use entity_map::{EntityMapCache, EntityMapRecord, ENTITY_MAP_KEY};
pub use error::{HomeKitError, HomeKitResult};
pub use hub::{
    CharacteristicDelta, ListenerId, StateCallback, Subscription, SubscriptionHub,
    SubscriptionSet,
};
pub use pairing::{Controller, Pairing, PairingData};
pub use runtime::HomeKitRuntime;
pub use state::{ConnectionState, InvalidTransition};
pub use storage::{Storable, StorageError, StorageFile, StorageResult, Store};
