//! HomeKit accessory structure for the HomeKit controller
//!
//! This crate provides the structural model of a paired HomeKit accessory or
//! bridge: accessories, their services and the characteristics on each
//! service, plus the [`CharacteristicRegistry`] that indexes one snapshot of
//! that tree and diffs it against another.
//!
//! Nothing here performs I/O. The controller crate owns fetching, caching and
//! polling; this crate only describes what was fetched.

pub mod model;
pub mod registry;
pub mod types;

pub use model::{
    Accessories, AccessoriesState, Accessory, AccessoryInfo, Characteristic, CharacteristicKey,
    CharacteristicRead, CharacteristicValue, CharacteristicWrite, EntityKey, HapStatus, Service,
    ServiceKey,
};
pub use registry::{CharacteristicRegistry, RegistryDiff};
pub use types::{CharacteristicType, Perm, ServiceType, TypeParseError};
