//! Runtime: pairing setup, entity map reuse across restarts, removal

mod common;

use common::*;
use ha_homekit_controller::{ConnectionState, HomeKitRuntime, PairingData};
use std::sync::Arc;
use tempfile::TempDir;

async fn start(dir: &TempDir, pairing: &Arc<MockPairing>) -> HomeKitRuntime {
    let controller = MockController::new();
    controller.add(pairing.clone());
    HomeKitRuntime::start(dir.path(), test_config(), controller)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_setup_and_shutdown() {
    let dir = TempDir::new().unwrap();
    let pairing = MockPairing::new(PAIRING_ID, lightbulb_tree(), 1);
    let runtime = start(&dir, &pairing).await;

    let conn = runtime
        .async_setup_pairing(PAIRING_ID, &PairingData::new())
        .await
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(runtime.pairing_ids(), vec![PAIRING_ID]);
    assert!(runtime.connection(PAIRING_ID).is_some());

    runtime.async_shutdown().await;
    assert!(runtime.pairing_ids().is_empty());
    assert!(pairing.is_shutdown());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unknown_pairing_fails_setup() {
    let dir = TempDir::new().unwrap();
    let pairing = MockPairing::new(PAIRING_ID, lightbulb_tree(), 1);
    let runtime = start(&dir, &pairing).await;

    assert!(runtime
        .async_setup_pairing("FF:FF:FF:FF:FF:FF", &PairingData::new())
        .await
        .is_err());
    assert!(runtime.pairing_ids().is_empty());
    assert!(!runtime.async_unload("FF:FF:FF:FF:FF:FF").await);
}

#[tokio::test]
async fn test_restart_uses_cached_structure() {
    let dir = TempDir::new().unwrap();
    let first = MockPairing::new(PAIRING_ID, lightbulb_tree(), 1);
    let runtime = start(&dir, &first).await;
    runtime
        .async_setup_pairing(PAIRING_ID, &PairingData::new())
        .await
        .unwrap();
    runtime.async_shutdown().await;

    let second = MockPairing::new(PAIRING_ID, lightbulb_tree(), 1);
    let runtime = start(&dir, &second).await;
    assert_eq!(runtime.cache().get(PAIRING_ID).unwrap().config_num, 1);

    let conn = runtime
        .async_setup_pairing(PAIRING_ID, &PairingData::new())
        .await
        .unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.config_num(), 1);
    assert_eq!(second.list_calls(), 0);
}

#[tokio::test]
async fn test_stale_cache_dropped_before_setup() {
    let dir = TempDir::new().unwrap();
    let first = MockPairing::new(PAIRING_ID, lightbulb_tree(), 1);
    let runtime = start(&dir, &first).await;
    runtime
        .async_setup_pairing(PAIRING_ID, &PairingData::new())
        .await
        .unwrap();
    runtime.async_shutdown().await;

    let second = MockPairing::new(PAIRING_ID, lightbulb_tree(), 2);
    let runtime = start(&dir, &second).await;

    // Discovery saw a new config number before the pairing was set up
    assert!(!runtime.async_config_num_changed(PAIRING_ID, 2).await.unwrap());
    assert!(runtime.cache().get(PAIRING_ID).is_none());

    let conn = runtime
        .async_setup_pairing(PAIRING_ID, &PairingData::new())
        .await
        .unwrap();
    assert_eq!(second.list_calls(), 1);
    assert_eq!(conn.config_num(), 2);
}

#[tokio::test]
async fn test_config_number_change_routes_to_connection() {
    let dir = TempDir::new().unwrap();
    let pairing = MockPairing::new(PAIRING_ID, lightbulb_tree(), 1);
    let runtime = start(&dir, &pairing).await;
    let conn = runtime
        .async_setup_pairing(PAIRING_ID, &PairingData::new())
        .await
        .unwrap();

    assert!(!runtime.async_config_num_changed(PAIRING_ID, 1).await.unwrap());
    pairing.set_tree(lightbulb_tree(), 5);
    assert!(runtime.async_config_num_changed(PAIRING_ID, 5).await.unwrap());
    assert_eq!(conn.config_num(), 5);
    assert_eq!(runtime.cache().get(PAIRING_ID).unwrap().config_num, 5);
}

#[tokio::test]
async fn test_remove_pairing_drops_cache() {
    let dir = TempDir::new().unwrap();
    let pairing = MockPairing::new(PAIRING_ID, lightbulb_tree(), 1);
    let runtime = start(&dir, &pairing).await;
    runtime
        .async_setup_pairing(PAIRING_ID, &PairingData::new())
        .await
        .unwrap();
    assert!(runtime.cache().contains(PAIRING_ID));

    runtime.async_remove_pairing(PAIRING_ID).await;

    assert!(runtime.connection(PAIRING_ID).is_none());
    assert!(!runtime.cache().contains(PAIRING_ID));
    assert!(pairing.is_shutdown());
}
