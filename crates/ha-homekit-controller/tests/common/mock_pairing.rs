//! Mock pairing for testing
//!
//! Plays the accessory side of a pairing from an in-memory tree. Failures,
//! latency and write statuses can be scripted per test, and every request is
//! recorded for assertions.

use async_trait::async_trait;
use ha_homekit_controller::{
    Controller, HomeKitError, HomeKitResult, Pairing, PairingData,
};
use ha_homekit_model::{
    Accessories, AccessoriesState, CharacteristicKey, CharacteristicRead, CharacteristicWrite,
    HapStatus,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A failure the mock can be told to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    NotFound,
    Disconnected,
    Authentication,
}

impl Failure {
    fn error(self) -> HomeKitError {
        match self {
            Failure::NotFound => HomeKitError::AccessoryNotFound("mock".into()),
            Failure::Disconnected => HomeKitError::AccessoryDisconnected("mock".into()),
            Failure::Authentication => HomeKitError::Authentication("mock".into()),
        }
    }
}

#[derive(Default)]
struct MockState {
    tree: Accessories,
    config_num: u64,
    values: HashMap<CharacteristicKey, Value>,
    latency: Duration,

    connect_failure: Option<Failure>,
    list_failures: Vec<Failure>,
    read_failure: Option<Failure>,
    write_statuses: HashMap<CharacteristicKey, HapStatus>,

    writes: Vec<CharacteristicWrite>,
    subscribe_calls: Vec<Vec<CharacteristicKey>>,
    unsubscribed: BTreeSet<CharacteristicKey>,
    subscribed: BTreeSet<CharacteristicKey>,
    shutdown: bool,
}

/// A scripted pairing
pub struct MockPairing {
    pairing_id: String,
    state: Mutex<MockState>,
    connect_calls: AtomicUsize,
    list_calls: AtomicUsize,
    read_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn tree_values(tree: &Accessories) -> HashMap<CharacteristicKey, Value> {
    let mut values = HashMap::new();
    for accessory in tree {
        for characteristic in accessory.services.iter().flat_map(|s| &s.characteristics) {
            if let Some(value) = characteristic.value() {
                values.insert(
                    CharacteristicKey::new(accessory.aid, characteristic.iid),
                    value.clone(),
                );
            }
        }
    }
    values
}

impl MockPairing {
    /// Create a mock serving `tree` at `config_num`
    pub fn new(pairing_id: impl Into<String>, tree: Accessories, config_num: u64) -> Arc<Self> {
        Arc::new(Self {
            pairing_id: pairing_id.into(),
            state: Mutex::new(MockState {
                values: tree_values(&tree),
                tree,
                config_num,
                ..Default::default()
            }),
            connect_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Replace the structure, as after a firmware update
    pub fn set_tree(&self, tree: Accessories, config_num: u64) {
        let mut state = self.state.lock().unwrap();
        state.values = tree_values(&tree);
        state.tree = tree;
        state.config_num = config_num;
    }

    /// Change a value on the device side
    pub fn set_value(&self, key: CharacteristicKey, value: Value) {
        self.state.lock().unwrap().values.insert(key, value);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    pub fn fail_connect(&self, failure: Option<Failure>) {
        self.state.lock().unwrap().connect_failure = failure;
    }

    /// Fail the next structure fetches, one failure per call
    pub fn fail_next_lists(&self, failures: Vec<Failure>) {
        self.state.lock().unwrap().list_failures = failures;
    }

    pub fn fail_reads(&self, failure: Option<Failure>) {
        self.state.lock().unwrap().read_failure = failure;
    }

    pub fn reject_write(&self, key: CharacteristicKey, status: HapStatus) {
        self.state.lock().unwrap().write_statuses.insert(key, status);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<CharacteristicWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<CharacteristicKey>> {
        self.state.lock().unwrap().subscribe_calls.clone()
    }

    pub fn subscribed(&self) -> BTreeSet<CharacteristicKey> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn unsubscribed(&self) -> BTreeSet<CharacteristicKey> {
        self.state.lock().unwrap().unsubscribed.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    async fn request<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let latency = self.state.lock().unwrap().latency;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl Pairing for MockPairing {
    fn pairing_id(&self) -> &str {
        &self.pairing_id
    }

    async fn connect(&self) -> HomeKitResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.request(|state| match state.connect_failure {
            Some(failure) => Err(failure.error()),
            None => Ok(()),
        })
        .await
    }

    async fn list_accessories_and_characteristics(&self) -> HomeKitResult<AccessoriesState> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.request(|state| {
            if !state.list_failures.is_empty() {
                return Err(state.list_failures.remove(0).error());
            }
            Ok(AccessoriesState {
                config_num: state.config_num,
                accessories: state.tree.clone(),
            })
        })
        .await
    }

    async fn get_characteristics(
        &self,
        keys: &[CharacteristicKey],
    ) -> HomeKitResult<HashMap<CharacteristicKey, CharacteristicRead>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.request(|state| {
            if let Some(failure) = state.read_failure {
                return Err(failure.error());
            }
            Ok(keys
                .iter()
                .map(|key| {
                    let read = match state.values.get(key) {
                        Some(value) => CharacteristicRead::value(value.clone()),
                        None => CharacteristicRead::failed(HapStatus(-70409)),
                    };
                    (*key, read)
                })
                .collect())
        })
        .await
    }

    async fn put_characteristics(
        &self,
        writes: &[CharacteristicWrite],
    ) -> HomeKitResult<HashMap<CharacteristicKey, HapStatus>> {
        self.request(|state| {
            let mut statuses = HashMap::new();
            for write in writes {
                state.writes.push(write.clone());
                match state.write_statuses.get(&write.key()) {
                    Some(status) => {
                        statuses.insert(write.key(), *status);
                    }
                    None => {
                        state.values.insert(write.key(), write.value.clone());
                    }
                }
            }
            Ok(statuses)
        })
        .await
    }

    async fn subscribe(&self, keys: &[CharacteristicKey]) -> HomeKitResult<()> {
        self.request(|state| {
            state.subscribe_calls.push(keys.to_vec());
            state.subscribed.extend(keys.iter().copied());
            Ok(())
        })
        .await
    }

    async fn unsubscribe(&self, keys: &[CharacteristicKey]) -> HomeKitResult<()> {
        self.request(|state| {
            for key in keys {
                state.subscribed.remove(key);
                state.unsubscribed.insert(*key);
            }
            Ok(())
        })
        .await
    }

    async fn shutdown(&self) -> HomeKitResult<()> {
        self.state.lock().unwrap().shutdown = true;
        Ok(())
    }
}

/// Hands out pre-built mock pairings by id
#[derive(Default)]
pub struct MockController {
    pairings: Mutex<HashMap<String, Arc<MockPairing>>>,
}

impl MockController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, pairing: Arc<MockPairing>) {
        self.pairings
            .lock()
            .unwrap()
            .insert(pairing.pairing_id().to_string(), pairing);
    }
}

impl Controller for MockController {
    fn load_pairing(
        &self,
        pairing_id: &str,
        _data: &PairingData,
    ) -> HomeKitResult<Arc<dyn Pairing>> {
        self.pairings
            .lock()
            .unwrap()
            .get(pairing_id)
            .cloned()
            .map(|p| p as Arc<dyn Pairing>)
            .ok_or_else(|| HomeKitError::AccessoryNotFound(pairing_id.to_string()))
    }
}
