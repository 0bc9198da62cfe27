//! Fixture accessory trees and connection setup

use ha_homekit_controller::{AccessoryConnection, EntityMapCache, HomeKitControllerConfig};
use ha_homekit_model::{
    Accessories, Accessory, Characteristic, CharacteristicType, Perm, Service, ServiceType,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::MockPairing;

pub const PAIRING_ID: &str = "00:11:22:33:44:55";

/// Fast timings; the poll loop is effectively off so tests poll by hand
pub fn test_config() -> HomeKitControllerConfig {
    HomeKitControllerConfig {
        poll_interval: 3600,
        retry_interval: 1,
        retry_base_delay: 1,
        entity_map_save_delay: 20,
        subscribe_cooldown: 20,
        poll_failures_before_unavailable: 1,
    }
}

pub fn info_service(name: &str, serial: &str) -> Service {
    let text = |iid, kind, value: &str| {
        Characteristic::new(iid, kind, vec![Perm::PairedRead])
            .with_format("string")
            .with_value(json!(value))
    };
    Service::new(1, ServiceType::AccessoryInformation)
        .with_characteristic(Characteristic::new(2, CharacteristicType::Identify, vec![Perm::PairedWrite]))
        .with_characteristic(text(3, CharacteristicType::Manufacturer, "Acme"))
        .with_characteristic(text(4, CharacteristicType::Model, "Bulb 1"))
        .with_characteristic(text(5, CharacteristicType::Name, name))
        .with_characteristic(text(6, CharacteristicType::SerialNumber, serial))
}

/// Lightbulb service: on (iid+1, events) and brightness (iid+2, 0-100)
pub fn lightbulb_service(iid: u64, on: bool, brightness: u64) -> Service {
    Service::new(iid, ServiceType::Lightbulb)
        .with_characteristic(
            Characteristic::new(
                iid + 1,
                CharacteristicType::On,
                vec![Perm::PairedRead, Perm::PairedWrite, Perm::Events],
            )
            .with_format("bool")
            .with_value(json!(on)),
        )
        .with_characteristic(
            Characteristic::new(
                iid + 2,
                CharacteristicType::Brightness,
                vec![Perm::PairedRead, Perm::PairedWrite],
            )
            .with_format("int")
            .with_range(json!(0), json!(100), Some(json!(1)))
            .with_value(json!(brightness)),
        )
}

pub fn lightbulb_accessory(aid: u64, serial: &str) -> Accessory {
    Accessory::new(aid)
        .with_service(info_service("Desk Lamp", serial))
        .with_service(lightbulb_service(7, true, 100))
}

/// One accessory (aid 1): info service at iid 1, lightbulb at iid 7 with
/// on at 8 and brightness at 9
pub fn lightbulb_tree() -> Accessories {
    Accessories::new(vec![lightbulb_accessory(1, "AB-1234")])
}

/// Build a connection over `pairing` with a fresh cache in `dir`
pub async fn connection(dir: &TempDir, pairing: &Arc<MockPairing>) -> AccessoryConnection {
    let cache = EntityMapCache::load(dir.path(), Duration::from_millis(20)).await;
    AccessoryConnection::new(pairing.clone(), cache, test_config())
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
