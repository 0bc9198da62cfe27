//! Accessory, service and characteristic model
//!
//! The serde layout matches the HAP `/accessories` JSON so a tree can be
//! cached and reloaded without loss. Fields the controller does not interpret
//! are kept in each level's `extra` map.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::types::{CharacteristicType, Perm, ServiceType};

/// A characteristic value as carried on the wire
pub type CharacteristicValue = Value;

/// Identity of a characteristic within a pairing: `(aid, iid)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicKey {
    pub aid: u64,
    pub iid: u64,
}

impl CharacteristicKey {
    pub fn new(aid: u64, iid: u64) -> Self {
        Self { aid, iid }
    }
}

impl From<(u64, u64)> for CharacteristicKey {
    fn from((aid, iid): (u64, u64)) -> Self {
        Self { aid, iid }
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.aid, self.iid)
    }
}

/// Identity of a service within a pairing: `(aid, iid)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub aid: u64,
    pub iid: u64,
}

impl ServiceKey {
    pub fn new(aid: u64, iid: u64) -> Self {
        Self { aid, iid }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.aid, self.iid)
    }
}

/// The structural element an entity is bound to
///
/// Entities are created per accessory, per service or per characteristic,
/// and each kind of binding is tracked separately so a service entity and a
/// characteristic entity on the same service never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKey {
    Accessory { aid: u64 },
    Service { aid: u64, iid: u64 },
    Characteristic { aid: u64, sid: u64, iid: u64 },
}

impl EntityKey {
    pub fn aid(&self) -> u64 {
        match self {
            EntityKey::Accessory { aid }
            | EntityKey::Service { aid, .. }
            | EntityKey::Characteristic { aid, .. } => *aid,
        }
    }

    /// The service this key belongs to, if any
    pub fn service(&self) -> Option<ServiceKey> {
        match self {
            EntityKey::Accessory { .. } => None,
            EntityKey::Service { aid, iid } => Some(ServiceKey::new(*aid, *iid)),
            EntityKey::Characteristic { aid, sid, .. } => Some(ServiceKey::new(*aid, *sid)),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Accessory { aid } => write!(f, "{}", aid),
            EntityKey::Service { aid, iid } => write!(f, "{}_{}", aid, iid),
            EntityKey::Characteristic { aid, sid, iid } => write!(f, "{}_{}_{}", aid, sid, iid),
        }
    }
}

/// Keep an explicit `null` distinct from an absent field
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A single readable/writable attribute of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Characteristic {
    pub iid: u64,

    /// Type UUID exactly as the accessory reported it
    #[serde(rename = "type")]
    pub type_uuid: String,

    /// Last known value (may be stale or absent)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub value: Option<Value>,

    #[serde(default)]
    pub perms: Vec<Perm>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(rename = "minValue", default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<Value>,

    #[serde(rename = "maxValue", default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<Value>,

    #[serde(rename = "minStep", default, skip_serializing_if = "Option::is_none")]
    pub min_step: Option<Value>,

    #[serde(rename = "valid-values", default, skip_serializing_if = "Option::is_none")]
    pub valid_values: Option<Vec<Value>>,

    #[serde(rename = "maxLen", default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Characteristic {
    /// Create a characteristic with the given type and permissions
    pub fn new(iid: u64, kind: CharacteristicType, perms: Vec<Perm>) -> Self {
        Self {
            iid,
            type_uuid: kind.uuid().to_string().to_uppercase(),
            value: None,
            perms,
            format: None,
            unit: None,
            min_value: None,
            max_value: None,
            min_step: None,
            valid_values: None,
            max_len: None,
            extra: Map::new(),
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_range(mut self, min: Value, max: Value, step: Option<Value>) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self.min_step = step;
        self
    }

    /// Parsed type; unparseable type strings are reported as a nil `Other`
    pub fn kind(&self) -> CharacteristicType {
        self.type_uuid
            .parse()
            .unwrap_or(CharacteristicType::Other(uuid::Uuid::nil()))
    }

    /// The current value, treating an explicit `null` as absent
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref().filter(|v| !v.is_null())
    }

    pub fn has_perm(&self, perm: &Perm) -> bool {
        self.perms.contains(perm)
    }

    pub fn is_readable(&self) -> bool {
        self.has_perm(&Perm::PairedRead)
    }

    pub fn is_writable(&self) -> bool {
        self.has_perm(&Perm::PairedWrite)
    }

    pub fn supports_events(&self) -> bool {
        self.has_perm(&Perm::Events)
    }

    /// Eligible for periodic `get_characteristics` polling
    pub fn is_pollable(&self) -> bool {
        self.is_readable() && !self.kind().is_event_only()
    }

    /// Eligible for push event subscription
    pub fn is_watchable(&self) -> bool {
        self.supports_events()
    }

    /// Compare everything except the value
    pub fn same_metadata(&self, other: &Characteristic) -> bool {
        self.iid == other.iid
            && self.type_uuid.eq_ignore_ascii_case(&other.type_uuid)
            && self.perms == other.perms
            && self.format == other.format
            && self.unit == other.unit
            && self.min_value == other.min_value
            && self.max_value == other.max_value
            && self.min_step == other.min_step
            && self.valid_values == other.valid_values
            && self.max_len == other.max_len
            && self.extra == other.extra
    }
}

/// A functional grouping of characteristics (e.g. one lightbulb)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub iid: u64,

    /// Type UUID exactly as the accessory reported it
    #[serde(rename = "type")]
    pub type_uuid: String,

    #[serde(default)]
    pub characteristics: Vec<Characteristic>,

    /// iids of linked services on the same accessory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked: Vec<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Service {
    pub fn new(iid: u64, kind: ServiceType) -> Self {
        Self {
            iid,
            type_uuid: kind.uuid().to_string().to_uppercase(),
            characteristics: Vec::new(),
            linked: Vec::new(),
            primary: None,
            hidden: None,
            extra: Map::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn kind(&self) -> ServiceType {
        self.type_uuid
            .parse()
            .unwrap_or(ServiceType::Other(uuid::Uuid::nil()))
    }

    pub fn characteristic(&self, iid: u64) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.iid == iid)
    }

    /// First characteristic of the given type on this service
    pub fn characteristic_of_type(&self, kind: CharacteristicType) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.kind() == kind)
    }

    pub fn has(&self, kind: CharacteristicType) -> bool {
        self.characteristic_of_type(kind).is_some()
    }

    /// Services are the same structural element when iid and type agree
    pub fn same_identity(&self, other: &Service) -> bool {
        self.iid == other.iid && self.kind() == other.kind()
    }
}

/// Identification strings from the accessory-information service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessoryInfo {
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_revision: Option<String>,
    pub hardware_revision: Option<String>,
}

/// A physical or bridged logical device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accessory {
    pub aid: u64,

    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Accessory {
    pub fn new(aid: u64) -> Self {
        Self {
            aid,
            services: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    pub fn service(&self, iid: u64) -> Option<&Service> {
        self.services.iter().find(|s| s.iid == iid)
    }

    pub fn services_of_type(&self, kind: ServiceType) -> impl Iterator<Item = &Service> {
        self.services.iter().filter(move |s| s.kind() == kind)
    }

    /// Read the accessory-information service, if present
    pub fn info(&self) -> AccessoryInfo {
        let Some(service) = self
            .services_of_type(ServiceType::AccessoryInformation)
            .next()
        else {
            return AccessoryInfo::default();
        };

        let text = |kind| {
            service
                .characteristic_of_type(kind)
                .and_then(|c| c.value())
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        AccessoryInfo {
            name: text(CharacteristicType::Name),
            manufacturer: text(CharacteristicType::Manufacturer),
            model: text(CharacteristicType::Model),
            serial_number: text(CharacteristicType::SerialNumber),
            firmware_revision: text(CharacteristicType::FirmwareRevision),
            hardware_revision: text(CharacteristicType::HardwareRevision),
        }
    }
}

/// The full accessory tree of one pairing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Accessories(pub Vec<Accessory>);

impl Accessories {
    pub fn new(accessories: Vec<Accessory>) -> Self {
        Self(accessories)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Accessory> {
        self.0.iter()
    }

    pub fn aid(&self, aid: u64) -> Option<&Accessory> {
        self.0.iter().find(|a| a.aid == aid)
    }

    pub fn has_aid(&self, aid: u64) -> bool {
        self.aid(aid).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Accessories {
    type Item = &'a Accessory;
    type IntoIter = std::slice::Iter<'a, Accessory>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A structure fetch result: the tree plus the config number it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoriesState {
    pub config_num: u64,
    pub accessories: Accessories,
}

/// One write request for `put_characteristics`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicWrite {
    pub aid: u64,
    pub iid: u64,
    pub value: Value,
}

impl CharacteristicWrite {
    pub fn new(key: CharacteristicKey, value: Value) -> Self {
        Self {
            aid: key.aid,
            iid: key.iid,
            value,
        }
    }

    pub fn key(&self) -> CharacteristicKey {
        CharacteristicKey::new(self.aid, self.iid)
    }
}

/// HAP status codes returned per characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HapStatus(pub i64);

impl HapStatus {
    pub const SUCCESS: HapStatus = HapStatus(0);

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            0 => "success",
            -70401 => "insufficient privileges",
            -70402 => "unable to communicate with service",
            -70403 => "resource is busy",
            -70404 => "cannot write to read only characteristic",
            -70405 => "cannot read from write only characteristic",
            -70406 => "notification is not supported",
            -70407 => "out of resources",
            -70408 => "operation timed out",
            -70409 => "resource does not exist",
            -70410 => "invalid value",
            -70411 => "insufficient authorization",
            _ => "unknown status",
        }
    }
}

impl fmt::Display for HapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}

/// One entry of a `get_characteristics` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicRead {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
}

impl CharacteristicRead {
    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            status: None,
        }
    }

    pub fn failed(status: HapStatus) -> Self {
        Self {
            value: None,
            status: Some(status.0),
        }
    }

    pub fn status(&self) -> HapStatus {
        HapStatus(self.status.unwrap_or(0))
    }
}

/// Keep only successful reads that carried a value
pub fn successful_values(
    reads: HashMap<CharacteristicKey, CharacteristicRead>,
) -> HashMap<CharacteristicKey, Value> {
    reads
        .into_iter()
        .filter(|(_, read)| read.status().is_success())
        .filter_map(|(key, read)| read.value.map(|v| (key, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_tree() -> Value {
        json!([{
            "aid": 1,
            "services": [{
                "iid": 1,
                "type": "0000003E-0000-1000-8000-0026BB765291",
                "characteristics": [
                    {"iid": 2, "type": "00000023-0000-1000-8000-0026BB765291",
                     "value": "Porch Light", "perms": ["pr"], "format": "string"},
                    {"iid": 3, "type": "00000030-0000-1000-8000-0026BB765291",
                     "value": "AB1234", "perms": ["pr"], "format": "string"}
                ]
            }, {
                "iid": 7,
                "type": "00000043-0000-1000-8000-0026BB765291",
                "primary": true,
                "characteristics": [
                    {"iid": 8, "type": "00000025-0000-1000-8000-0026BB765291",
                     "value": false, "perms": ["pr", "pw", "ev"], "format": "bool"},
                    {"iid": 9, "type": "00000008-0000-1000-8000-0026BB765291",
                     "value": 0, "perms": ["pr", "pw"], "format": "int",
                     "minValue": 0, "maxValue": 100, "minStep": 1, "unit": "percentage",
                     "vendor-field": {"x": 1}},
                    {"iid": 10, "type": "00000073-0000-1000-8000-0026BB765291",
                     "value": null, "perms": ["pr", "ev"], "format": "uint8"}
                ]
            }]
        }])
    }

    #[test]
    fn test_tree_roundtrip_is_lossless() {
        let raw = raw_tree();
        let accessories: Accessories = serde_json::from_value(raw.clone()).unwrap();
        let encoded = serde_json::to_value(&accessories).unwrap();
        assert_eq!(encoded, raw);
    }

    #[test]
    fn test_explicit_null_value_is_absent_but_preserved() {
        let accessories: Accessories = serde_json::from_value(raw_tree()).unwrap();
        let event = accessories.aid(1).unwrap().service(7).unwrap().characteristic(10).unwrap();
        assert_eq!(event.value, Some(Value::Null));
        assert_eq!(event.value(), None);
    }

    #[test]
    fn test_kinds_and_eligibility() {
        let accessories: Accessories = serde_json::from_value(raw_tree()).unwrap();
        let light = accessories.aid(1).unwrap().service(7).unwrap();
        assert_eq!(light.kind(), ServiceType::Lightbulb);

        let on = light.characteristic_of_type(CharacteristicType::On).unwrap();
        assert!(on.is_pollable());
        assert!(on.is_watchable());

        let brightness = light.characteristic(9).unwrap();
        assert!(brightness.is_pollable());
        assert!(!brightness.is_watchable());

        let button = light.characteristic(10).unwrap();
        assert!(!button.is_pollable());
        assert!(button.is_watchable());
    }

    #[test]
    fn test_accessory_info() {
        let accessories: Accessories = serde_json::from_value(raw_tree()).unwrap();
        let info = accessories.aid(1).unwrap().info();
        assert_eq!(info.name.as_deref(), Some("Porch Light"));
        assert_eq!(info.serial_number.as_deref(), Some("AB1234"));
        assert_eq!(info.manufacturer, None);
    }

    #[test]
    fn test_same_metadata_ignores_value() {
        let a = Characteristic::new(8, CharacteristicType::On, vec![Perm::PairedRead])
            .with_value(json!(true));
        let b = a.clone().with_value(json!(false));
        assert!(a.same_metadata(&b));

        let mut c = a.clone();
        c.perms.push(Perm::Events);
        assert!(!a.same_metadata(&c));
    }

    #[test]
    fn test_successful_values_drops_failures() {
        let reads = HashMap::from([
            (CharacteristicKey::new(1, 8), CharacteristicRead::value(json!(true))),
            (
                CharacteristicKey::new(1, 9),
                CharacteristicRead::failed(HapStatus(-70402)),
            ),
        ]);
        let values = successful_values(reads);
        assert_eq!(values.len(), 1);
        assert_eq!(values[&CharacteristicKey::new(1, 8)], json!(true));
    }

    #[test]
    fn test_entity_key_display() {
        assert_eq!(EntityKey::Accessory { aid: 1 }.to_string(), "1");
        assert_eq!(EntityKey::Service { aid: 1, iid: 7 }.to_string(), "1_7");
        assert_eq!(
            EntityKey::Characteristic { aid: 1, sid: 7, iid: 8 }.to_string(),
            "1_7_8"
        );
    }
}
