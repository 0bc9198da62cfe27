//! Accessory connection
//!
//! One [`AccessoryConnection`] per paired accessory or bridge. It owns the
//! pairing, the current [`CharacteristicRegistry`], the [`SubscriptionHub`]
//! and the factory dispatch, and drives the lifecycle:
//!
//! - `connect()` loads the structure from the entity map cache or the device,
//!   builds entities and starts polling; transient failures retry with backoff
//! - `poll()` and `deliver_event()` feed new values through one ordered
//!   dispatch path
//! - `async_refresh_entity_map()` refetches the structure after a config
//!   number change and reconciles entities without disturbing unchanged ones
//! - `unload()` cancels every task before tearing entities down
//!
//! All transport calls share one FIFO lock since pairings are not assumed to
//! handle concurrent requests.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ha_homekit_model::model::successful_values;
use ha_homekit_model::{
    Accessories, AccessoryInfo, CharacteristicKey, CharacteristicRegistry, CharacteristicValue,
    CharacteristicWrite, EntityKey, RegistryDiff,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::HomeKitControllerConfig;
use crate::dispatch::{
    AccessoryFactory, CharacteristicFactory, Claim, EntityFactoryDispatch, Platform,
    ServiceFactory,
};
use crate::entity::HomeKitEntity;
use crate::entity_map::{EntityMapCache, EntityMapRecord};
use crate::error::{HomeKitError, HomeKitResult};
use crate::hub::{StateCallback, Subscription, SubscriptionHub};
use crate::pairing::Pairing;
use crate::state::{retry_delay, ConnectionState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Entity lifecycle notifications for the host
#[derive(Clone)]
pub enum EntityEvent {
    Added(Arc<HomeKitEntity>),
    Removed(EntityKey),
}

impl fmt::Debug for EntityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityEvent::Added(entity) => f.debug_tuple("Added").field(&entity.key()).finish(),
            EntityEvent::Removed(key) => f.debug_tuple("Removed").field(key).finish(),
        }
    }
}

/// Result of one poll attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The connection is not ready, or was unloaded mid-poll
    NotReady,
    /// No pollable characteristics; availability refreshed from the pairing
    NothingToPoll,
    /// A previous poll is still in flight
    Skipped,
    /// The poll succeeded; `changed` values were dispatched
    Updated { changed: usize },
    Failed,
}

/// Serializable snapshot for diagnostics downloads
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDiagnostics {
    pub pairing_id: String,
    pub state: ConnectionState,
    pub available: bool,
    pub config_num: u64,
    pub accessories: usize,
    pub characteristics: usize,
    pub pollable: usize,
    pub watchable: usize,
    pub entities: usize,
    pub poll_failures: u32,
    pub retry_attempts: u32,
    pub unreliable_serial_numbers: bool,
    pub last_successful_poll: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tasks {
    poll: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    subscribe: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [self.poll.take(), self.retry.take(), self.subscribe.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// Clears the in-flight flag even if the poll future is dropped
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    pairing_id: String,
    pairing: Arc<dyn Pairing>,
    cache: EntityMapCache,
    config: HomeKitControllerConfig,

    registry: RwLock<CharacteristicRegistry>,
    hub: Arc<SubscriptionHub>,
    dispatch: Mutex<EntityFactoryDispatch>,
    entities: DashMap<EntityKey, Arc<HomeKitEntity>>,

    state: watch::Sender<ConnectionState>,
    available: watch::Sender<bool>,
    config_changed: broadcast::Sender<u64>,
    entity_events: broadcast::Sender<EntityEvent>,

    /// Serializes connect, refresh and unload
    setup_lock: tokio::sync::Mutex<()>,
    /// Serializes every call into the pairing, FIFO
    transport: tokio::sync::Mutex<()>,
    /// Keeps registry updates and hub dispatch in one order
    dispatch_lock: Mutex<()>,

    config_num: AtomicU64,
    poll_in_flight: AtomicBool,
    poll_warned: AtomicBool,
    poll_failures: AtomicU32,
    retry_attempts: AtomicU32,
    last_poll: RwLock<Option<DateTime<Utc>>>,
    unreliable_serial_numbers: AtomicBool,
    unloading: AtomicBool,
    /// A structure refresh is running over an installed registry
    refreshing: AtomicBool,

    pending_subscribes: Mutex<BTreeSet<CharacteristicKey>>,
    subscribe_scheduled: AtomicBool,
    platforms: Mutex<BTreeSet<Platform>>,
    tasks: Mutex<Tasks>,
}

/// Live connection to one paired accessory or bridge
#[derive(Clone)]
pub struct AccessoryConnection {
    inner: Arc<Inner>,
}

/// Non-owning handle held by entities
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<AccessoryConnection> {
        self.inner.upgrade().map(|inner| AccessoryConnection { inner })
    }
}

/// Whether a serial number can identify a device
///
/// Empty serials and small numbers (`"0"`, `"1"`, `"0.1"`) are placeholders
/// some firmware reports for every unit. The last `.` is dropped before the
/// numeric check, so `"1.0"` reads as 10.
pub fn valid_serial_number(serial: Option<&str>) -> bool {
    let Some(serial) = serial.filter(|s| !s.is_empty()) else {
        return false;
    };
    let joined = match serial.rsplit_once('.') {
        Some((head, tail)) => format!("{}{}", head, tail),
        None => serial.to_string(),
    };
    match joined.parse::<f64>() {
        Ok(number) => number > 1.0,
        Err(_) => true,
    }
}

/// Values in `new` that differ from `old`, for keys both trees share
fn refreshed_values(
    old: &CharacteristicRegistry,
    new: &CharacteristicRegistry,
) -> BTreeMap<CharacteristicKey, CharacteristicValue> {
    let mut changed = BTreeMap::new();
    for accessory in new.accessories() {
        for characteristic in accessory.services.iter().flat_map(|s| &s.characteristics) {
            let key = CharacteristicKey::new(accessory.aid, characteristic.iid);
            let Some(value) = characteristic.value() else {
                continue;
            };
            if characteristic.kind().is_event_only() || !old.contains(&key) {
                continue;
            }
            if old.value(&key) != Some(value) {
                changed.insert(key, value.clone());
            }
        }
    }
    changed
}

impl AccessoryConnection {
    pub fn new(
        pairing: Arc<dyn Pairing>,
        cache: EntityMapCache,
        config: HomeKitControllerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (available, _) = watch::channel(false);
        let (config_changed, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (entity_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                pairing_id: pairing.pairing_id().to_string(),
                pairing,
                cache,
                config,
                registry: RwLock::new(CharacteristicRegistry::default()),
                hub: SubscriptionHub::new(),
                dispatch: Mutex::new(EntityFactoryDispatch::new()),
                entities: DashMap::new(),
                state,
                available,
                config_changed,
                entity_events,
                setup_lock: tokio::sync::Mutex::new(()),
                transport: tokio::sync::Mutex::new(()),
                dispatch_lock: Mutex::new(()),
                config_num: AtomicU64::new(0),
                poll_in_flight: AtomicBool::new(false),
                poll_warned: AtomicBool::new(false),
                poll_failures: AtomicU32::new(0),
                retry_attempts: AtomicU32::new(0),
                last_poll: RwLock::new(None),
                unreliable_serial_numbers: AtomicBool::new(false),
                unloading: AtomicBool::new(false),
                refreshing: AtomicBool::new(false),
                pending_subscribes: Mutex::new(BTreeSet::new()),
                subscribe_scheduled: AtomicBool::new(false),
                platforms: Mutex::new(BTreeSet::new()),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn pairing_id(&self) -> &str {
        &self.inner.pairing_id
    }

    pub fn pairing(&self) -> &Arc<dyn Pairing> {
        &self.inner.pairing
    }

    pub fn config(&self) -> &HomeKitControllerConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn available(&self) -> bool {
        *self.inner.available.borrow()
    }

    pub fn config_num(&self) -> u64 {
        self.inner.config_num.load(Ordering::Acquire)
    }

    pub fn unreliable_serial_numbers(&self) -> bool {
        self.inner.unreliable_serial_numbers.load(Ordering::Acquire)
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.inner.hub
    }

    /// Read access to the current registry
    pub fn with_registry<R>(&self, f: impl FnOnce(&CharacteristicRegistry) -> R) -> R {
        let registry = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&registry)
    }

    /// A copy of the current accessory tree, including latest values
    pub fn entity_map(&self) -> Accessories {
        self.with_registry(|r| r.accessories().clone())
    }

    pub fn current_state<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a CharacteristicKey>,
    ) -> HashMap<CharacteristicKey, CharacteristicValue> {
        self.with_registry(|r| r.current_state(keys))
    }

    pub fn accessory_info(&self, aid: u64) -> Option<AccessoryInfo> {
        self.with_registry(|r| r.accessory(aid).map(|a| a.info()))
    }

    pub fn entity(&self, key: &EntityKey) -> Option<Arc<HomeKitEntity>> {
        self.inner.entities.get(key).map(|e| e.value().clone())
    }

    /// Bound entities, ordered by key
    pub fn entities(&self) -> Vec<Arc<HomeKitEntity>> {
        let mut entities: Vec<_> = self
            .inner
            .entities
            .iter()
            .map(|e| e.value().clone())
            .collect();
        entities.sort_by_key(|e| e.key());
        entities
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_availability(&self) -> watch::Receiver<bool> {
        self.inner.available.subscribe()
    }

    /// Receives the new config number after every structure refresh
    pub fn subscribe_config_changed(&self) -> broadcast::Receiver<u64> {
        self.inner.config_changed.subscribe()
    }

    pub fn subscribe_entities(&self) -> broadcast::Receiver<EntityEvent> {
        self.inner.entity_events.subscribe()
    }

    fn transition(&self, to: ConnectionState) -> HomeKitResult<()> {
        let mut result = Ok(());
        let mut from = to;
        self.inner.state.send_if_modified(|state| {
            from = *state;
            match state.try_transition(to) {
                Ok(next) => {
                    let changed = *state != next;
                    *state = next;
                    changed
                }
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        if result.is_ok() && from != to {
            info!(pairing_id = %self.inner.pairing_id, %from, %to, "Connection state changed");
        }
        result.map_err(Into::into)
    }

    fn set_available(&self, available: bool) {
        let changed = self.inner.available.send_if_modified(|current| {
            if *current == available {
                false
            } else {
                *current = available;
                true
            }
        });
        if changed {
            info!(pairing_id = %self.inner.pairing_id, available, "Availability changed");
        }
    }

    /// Whether values may flow: ready, or refreshing over an installed tree
    fn accepts_values(&self) -> bool {
        if self.inner.unloading.load(Ordering::Acquire) {
            return false;
        }
        match self.state() {
            ConnectionState::Ready => true,
            ConnectionState::FetchingStructure => self.inner.refreshing.load(Ordering::Acquire),
            _ => false,
        }
    }

    // ==================== Setup ====================

    /// Load the structure, build entities and start polling
    ///
    /// Returns `Ok(true)` once ready and `Ok(false)` when a retry has been
    /// scheduled. Authentication failures are returned as errors and never
    /// retried. Calling this on a ready connection does nothing.
    #[instrument(skip(self), fields(pairing_id = %self.inner.pairing_id))]
    pub async fn connect(&self) -> HomeKitResult<bool> {
        let _setup = self.inner.setup_lock.lock().await;
        if self.state().is_ready() {
            return Ok(true);
        }

        let pending_retry = self.tasks().retry.take();
        if let Some(retry) = pending_retry {
            retry.abort();
        }
        self.inner.unloading.store(false, Ordering::Release);

        let ready = self.attempt_setup().await?;
        if !ready {
            self.schedule_retry();
        }
        Ok(ready)
    }

    async fn retry_setup(&self) -> HomeKitResult<bool> {
        let _setup = self.inner.setup_lock.lock().await;
        if self.state() != ConnectionState::RetryWait {
            return Ok(true);
        }
        self.attempt_setup().await
    }

    /// One pass of connect → fetch → ready; caller holds the setup lock
    async fn attempt_setup(&self) -> HomeKitResult<bool> {
        self.transition(ConnectionState::Connecting)?;

        let connected = {
            let _transport = self.inner.transport.lock().await;
            self.inner.pairing.connect().await
        };
        if let Err(e) = connected {
            return self.setup_failed(e);
        }

        self.transition(ConnectionState::FetchingStructure)?;
        let record = match self.load_structure().await {
            Ok(record) => record,
            Err(e) => return self.setup_failed(e),
        };

        self.install(record)?;
        self.add_entities();
        self.start_polling();
        self.poll().await;
        Ok(true)
    }

    fn setup_failed(&self, e: HomeKitError) -> HomeKitResult<bool> {
        self.set_available(false);
        if e.is_authentication() {
            error!(pairing_id = %self.inner.pairing_id, "Pairing rejected, re-pair required: {}", e);
            self.transition(ConnectionState::Failed)?;
            return Err(e);
        }
        warn!(pairing_id = %self.inner.pairing_id, "Setup failed, will retry: {}", e);
        self.transition(ConnectionState::RetryWait)?;
        Ok(false)
    }

    async fn load_structure(&self) -> HomeKitResult<EntityMapRecord> {
        if let Some(record) = self.inner.cache.get(&self.inner.pairing_id) {
            debug!(config_num = record.config_num, "Using cached entity map");
            return Ok(record);
        }

        debug!("Fetching accessory structure");
        let fetched = {
            let _transport = self.inner.transport.lock().await;
            self.inner
                .pairing
                .list_accessories_and_characteristics()
                .await?
        };
        Ok(self
            .inner
            .cache
            .put(&self.inner.pairing_id, fetched.config_num, fetched.accessories))
    }

    fn install(&self, record: EntityMapRecord) -> HomeKitResult<()> {
        let registry = CharacteristicRegistry::new(record.accessories);
        let accessories = registry.accessories().len();
        {
            let mut current = self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *current = registry;
        }
        self.inner
            .config_num
            .store(record.config_num, Ordering::Release);
        self.inner.poll_failures.store(0, Ordering::Release);
        self.inner.retry_attempts.store(0, Ordering::Release);
        self.detect_workarounds();

        self.transition(ConnectionState::Ready)?;
        self.set_available(self.inner.pairing.is_available());
        info!(
            pairing_id = %self.inner.pairing_id,
            config_num = record.config_num,
            accessories,
            "HomeKit connection ready"
        );
        Ok(())
    }

    fn schedule_retry(&self) {
        let weak = self.downgrade();
        let base = self.inner.config.retry_base_delay();
        let ceiling = self.inner.config.retry_interval();

        let handle = tokio::spawn(async move {
            let mut tries = 0;
            loop {
                let delay = retry_delay(tries, base, ceiling);
                match weak.upgrade() {
                    Some(conn) => {
                        conn.inner
                            .retry_attempts
                            .store(tries + 1, Ordering::Release);
                        debug!(pairing_id = %conn.inner.pairing_id, ?delay, "Scheduling setup retry");
                    }
                    None => return,
                }

                tokio::time::sleep(delay).await;

                let Some(conn) = weak.upgrade() else {
                    return;
                };
                match conn.retry_setup().await {
                    Ok(false) => tries = tries.saturating_add(1),
                    Ok(true) | Err(_) => return,
                }
            }
        });

        self.tasks().retry = Some(handle);
    }

    fn detect_workarounds(&self) {
        let unreliable = self.with_registry(|registry| {
            let mut seen: HashSet<Option<String>> = HashSet::new();
            let mut unreliable = false;

            for accessory in registry.accessories() {
                let info = accessory.info();
                let serial = info.serial_number.as_deref();

                if !valid_serial_number(serial) {
                    debug!(aid = accessory.aid, ?serial, "Serial number is not a valid identifier");
                    unreliable = true;
                } else if seen.contains(&info.serial_number) {
                    debug!(aid = accessory.aid, ?serial, "Serial number is duplicated within pairing");
                    unreliable = true;
                } else if info.serial_number == info.hardware_revision {
                    debug!(aid = accessory.aid, ?serial, "Serial number is the hardware revision");
                    unreliable = true;
                }
                seen.insert(info.serial_number.clone());
            }
            unreliable
        });

        self.inner
            .unreliable_serial_numbers
            .store(unreliable, Ordering::Release);
    }

    // ==================== Entities ====================

    /// Run every factory over the current tree and bind new entities
    fn add_entities(&self) -> Vec<Arc<HomeKitEntity>> {
        let claims = self.with_registry(|registry| self.dispatch_guard().run(registry));
        self.bind(claims)
    }

    fn bind(&self, claims: Vec<Claim>) -> Vec<Arc<HomeKitEntity>> {
        let mut added = Vec::with_capacity(claims.len());
        for claim in claims {
            let entity = Arc::new(HomeKitEntity::new(
                self.downgrade(),
                &self.inner.pairing_id,
                claim.key,
                claim.behavior,
            ));
            entity.added(self);
            self.inner.entities.insert(claim.key, entity.clone());
            debug!(pairing_id = %self.inner.pairing_id, key = %claim.key, "Entity added");
            let _ = self
                .inner
                .entity_events
                .send(EntityEvent::Added(entity.clone()));
            added.push(entity);
        }
        added
    }

    /// Register a service factory; it runs at once over the current tree
    ///
    /// Factories run with the dispatch table locked and must not call back
    /// into the connection.
    ///
    /// # Panics
    ///
    /// Entities built here register hub callbacks, which spawn tasks; call it
    /// from within a Tokio runtime when the tree is not empty.
    pub fn add_listener(&self, factory: ServiceFactory) -> Vec<Arc<HomeKitEntity>> {
        let claims =
            self.with_registry(|registry| self.dispatch_guard().add_listener(factory, registry));
        self.bind(claims)
    }

    /// Register an accessory factory; it runs at once over the current tree
    ///
    /// Same runtime requirement as [`AccessoryConnection::add_listener`].
    pub fn add_accessory_factory(&self, factory: AccessoryFactory) -> Vec<Arc<HomeKitEntity>> {
        let claims = self.with_registry(|registry| {
            self.dispatch_guard()
                .add_accessory_factory(factory, registry)
        });
        self.bind(claims)
    }

    /// Register a characteristic factory; it runs at once over the current tree
    ///
    /// Same runtime requirement as [`AccessoryConnection::add_listener`].
    pub fn add_char_factory(&self, factory: CharacteristicFactory) -> Vec<Arc<HomeKitEntity>> {
        let claims = self
            .with_registry(|registry| self.dispatch_guard().add_char_factory(factory, registry));
        self.bind(claims)
    }

    /// Forget a removed entity so its element can be claimed again
    pub fn entity_key_removed(&self, key: &EntityKey) {
        let known = self.inner.entities.remove(key).is_some();
        self.dispatch_guard().release(key);
        if known {
            debug!(pairing_id = %self.inner.pairing_id, %key, "Entity removed");
            let _ = self.inner.entity_events.send(EntityEvent::Removed(*key));
        }
    }

    /// Platforms the current tree needs that were not reported before
    pub fn platforms_to_load(&self) -> BTreeSet<Platform> {
        let needed: BTreeSet<Platform> = self.with_registry(|registry| {
            let mut needed = BTreeSet::new();
            for service in registry.accessories().iter().flat_map(|a| &a.services) {
                needed.extend(Platform::for_service(service.kind()));
                for characteristic in &service.characteristics {
                    needed.extend(Platform::for_characteristic(characteristic.kind()));
                }
            }
            needed
        });

        let mut loaded = self
            .inner
            .platforms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let to_load: BTreeSet<Platform> = needed.difference(&loaded).copied().collect();
        loaded.extend(to_load.iter().copied());
        to_load
    }

    // ==================== Interest ====================

    pub fn add_pollable_characteristics(&self, keys: impl IntoIterator<Item = CharacteristicKey>) {
        self.inner.hub.add_pollable(keys);
    }

    pub fn remove_pollable_characteristics(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
    ) {
        self.inner.hub.remove_pollable(keys);
    }

    /// Add event interest; newly watched keys are subscribed after a short
    /// cooldown so a burst of entities produces one request
    pub fn add_watchable_characteristics(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
    ) {
        let added = self.inner.hub.add_watchable(keys);
        if added.is_empty() {
            return;
        }
        self.pending_subscribes().extend(added);
        self.schedule_subscribe();
    }

    pub fn remove_watchable_characteristics(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
    ) {
        let removed = self.inner.hub.remove_watchable(keys);
        if removed.is_empty() {
            return;
        }

        let subscribed: Vec<CharacteristicKey> = {
            let mut pending = self.pending_subscribes();
            removed
                .into_iter()
                .filter(|key| !pending.remove(key))
                .collect()
        };
        if subscribed.is_empty() || self.inner.unloading.load(Ordering::Acquire) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(pairing_id = %self.inner.pairing_id, "No runtime to unsubscribe events");
            return;
        };
        let conn = self.clone();
        handle.spawn(async move {
            conn.unsubscribe_keys(&subscribed).await;
        });
    }

    /// Register a callback for value changes on `keys`
    ///
    /// # Panics
    ///
    /// Outside a Tokio runtime, since the callback runs on a spawned task.
    pub fn async_subscribe(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
        callback: StateCallback,
    ) -> Subscription {
        self.inner.hub.subscribe(keys, callback)
    }

    fn schedule_subscribe(&self) {
        if self.inner.subscribe_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        // Keys stay pending for the next call made inside a runtime
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner
                .subscribe_scheduled
                .store(false, Ordering::Release);
            debug!(pairing_id = %self.inner.pairing_id, "No runtime to schedule event subscription");
            return;
        };

        let weak = self.downgrade();
        let cooldown = self.inner.config.subscribe_cooldown();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(cooldown).await;
            if let Some(conn) = weak.upgrade() {
                conn.flush_subscriptions().await;
            }
        });
        self.tasks().subscribe = Some(handle);
    }

    async fn flush_subscriptions(&self) {
        self.inner
            .subscribe_scheduled
            .store(false, Ordering::Release);

        let keys: Vec<CharacteristicKey> = std::mem::take(&mut *self.pending_subscribes())
            .into_iter()
            .filter(|key| self.inner.hub.is_watchable(key))
            .collect();
        if keys.is_empty() {
            return;
        }

        debug!(pairing_id = %self.inner.pairing_id, count = keys.len(), "Subscribing to events");
        let result = {
            let _transport = self.inner.transport.lock().await;
            self.inner.pairing.subscribe(&keys).await
        };
        if let Err(e) = result {
            warn!(pairing_id = %self.inner.pairing_id, "Event subscription failed: {}", e);
            self.set_available(false);
        }
    }

    async fn unsubscribe_keys(&self, keys: &[CharacteristicKey]) {
        let result = {
            let _transport = self.inner.transport.lock().await;
            self.inner.pairing.unsubscribe(keys).await
        };
        if let Err(e) = result {
            debug!(pairing_id = %self.inner.pairing_id, "Unsubscribe failed: {}", e);
        }
    }

    // ==================== Values ====================

    fn start_polling(&self) {
        let weak = self.downgrade();
        let period = self.inner.config.poll_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                // Polled inline so aborting the loop also cancels a poll in
                // flight; ticks missed meanwhile are skipped
                conn.poll().await;
            }
        });

        if let Some(previous) = self.tasks().poll.replace(handle) {
            previous.abort();
        }
    }

    /// Read every pollable characteristic once
    ///
    /// Never runs concurrently with itself: while a poll is in flight further
    /// calls return [`PollOutcome::Skipped`].
    #[instrument(skip(self), fields(pairing_id = %self.inner.pairing_id))]
    pub async fn poll(&self) -> PollOutcome {
        if !self.state().is_ready() {
            return PollOutcome::NotReady;
        }

        let keys: Vec<CharacteristicKey> = {
            let pollable = self.inner.hub.pollable_keys();
            self.with_registry(|r| pollable.into_iter().filter(|k| r.contains(k)).collect())
        };
        if keys.is_empty() {
            self.set_available(self.inner.pairing.is_available());
            debug!("Not polling any characteristics");
            return PollOutcome::NothingToPoll;
        }

        if self
            .inner
            .poll_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if !self.inner.poll_warned.swap(true, Ordering::AcqRel) {
                warn!("Poll skipped as previous poll still in flight");
            }
            return PollOutcome::Skipped;
        }
        let _in_flight = PollGuard(&self.inner.poll_in_flight);

        if self.inner.poll_warned.swap(false, Ordering::AcqRel) {
            info!("No longer detecting back pressure, polling resumed");
        }

        debug!(count = keys.len(), "Starting poll");
        let result = {
            let _transport = self.inner.transport.lock().await;
            self.inner.pairing.get_characteristics(&keys).await
        };

        if !self.state().is_ready() {
            return PollOutcome::NotReady;
        }

        match result {
            Ok(reads) => {
                self.inner.poll_failures.store(0, Ordering::Release);
                *self
                    .inner
                    .last_poll
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
                let changed = self.process_new_values(successful_values(reads));
                debug!(changed = changed.len(), "Finished poll");
                PollOutcome::Updated {
                    changed: changed.len(),
                }
            }
            Err(e) => {
                self.record_poll_failure(&e);
                PollOutcome::Failed
            }
        }
    }

    /// Poll on demand, under the same back-pressure rule as the timer
    pub async fn async_request_update(&self) -> PollOutcome {
        self.poll().await
    }

    fn record_poll_failure(&self, e: &HomeKitError) {
        if matches!(e, HomeKitError::AccessoryNotFound(_)) {
            warn!("Accessory not found on the network: {}", e);
            self.set_available(false);
            return;
        }

        let failures = self.inner.poll_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(failures, "Poll failed: {}", e);
        if failures >= self.inner.config.poll_failures_before_unavailable {
            self.set_available(false);
        }
    }

    /// Apply values pushed by the accessory
    ///
    /// Goes through the same path as a poll response, so listeners cannot
    /// tell the two apart. Events reaching a connection that is not set up
    /// are dropped and leave availability alone.
    pub fn deliver_event(
        &self,
        values: impl IntoIterator<Item = (CharacteristicKey, CharacteristicValue)>,
    ) -> BTreeMap<CharacteristicKey, CharacteristicValue> {
        if !self.accepts_values() {
            return BTreeMap::new();
        }
        self.inner.poll_failures.store(0, Ordering::Release);
        self.process_new_values(values)
    }

    fn process_new_values(
        &self,
        values: impl IntoIterator<Item = (CharacteristicKey, CharacteristicValue)>,
    ) -> BTreeMap<CharacteristicKey, CharacteristicValue> {
        let _order = self
            .inner
            .dispatch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !self.accepts_values() {
            trace!(pairing_id = %self.inner.pairing_id, "Dropping values for inactive connection");
            return BTreeMap::new();
        }
        self.set_available(true);

        let changed = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_values(values);

        if !changed.is_empty() {
            trace!(changed = changed.len(), "Dispatching new values");
            self.inner.hub.dispatch(&changed);
        }
        changed
    }

    /// Write values to the accessory
    ///
    /// Any rejected write is returned as [`HomeKitError::WriteFailed`];
    /// accepted writes are applied locally and dispatched straight away.
    /// During a structure refresh writes queue behind the fetch.
    #[instrument(skip(self, writes), fields(pairing_id = %self.inner.pairing_id, count = writes.len()))]
    pub async fn put_characteristics(&self, writes: Vec<CharacteristicWrite>) -> HomeKitResult<()> {
        if !self.accepts_values() {
            return Err(HomeKitError::NotConnected(self.inner.pairing_id.clone()));
        }
        let unknown =
            self.with_registry(|r| writes.iter().map(|w| w.key()).find(|key| !r.contains(key)));
        if let Some(unknown) = unknown {
            return Err(HomeKitError::UnknownCharacteristic {
                aid: unknown.aid,
                iid: unknown.iid,
            });
        }

        let statuses = {
            let _transport = self.inner.transport.lock().await;
            self.inner.pairing.put_characteristics(&writes).await?
        };

        let failed: BTreeMap<CharacteristicKey, _> = statuses
            .into_iter()
            .filter(|(_, status)| !status.is_success())
            .collect();

        let accepted = writes
            .into_iter()
            .filter(|w| !failed.contains_key(&w.key()))
            .map(|w| (w.key(), w.value));
        self.process_new_values(accepted);

        match failed.into_iter().next() {
            Some((key, status)) => {
                warn!(%key, %status, "Characteristic write rejected");
                Err(HomeKitError::WriteFailed {
                    aid: key.aid,
                    iid: key.iid,
                    status,
                })
            }
            None => Ok(()),
        }
    }

    // ==================== Structure changes ====================

    /// Refresh only if `config_num` differs from the one in use
    ///
    /// Any difference counts, including a lower number after a factory
    /// reset. Before the connection is ready, a stale cache record is dropped
    /// so setup fetches the live structure instead.
    pub async fn refresh_if_config_changed(&self, config_num: u64) -> HomeKitResult<bool> {
        let current = self.config_num();
        if config_num == current && self.state().is_ready() {
            return Ok(false);
        }

        if !self.state().is_ready() {
            if self
                .inner
                .cache
                .get(&self.inner.pairing_id)
                .is_some_and(|record| record.config_num != config_num)
            {
                debug!(pairing_id = %self.inner.pairing_id, config_num, "Dropping stale cached entity map");
                self.inner.cache.delete(&self.inner.pairing_id);
            }
            return Ok(false);
        }

        info!(pairing_id = %self.inner.pairing_id, current, config_num, "Config number changed");
        self.async_refresh_entity_map(config_num).await?;
        Ok(true)
    }

    /// Refetch the structure and reconcile entities against it
    ///
    /// Entities whose accessory, service or characteristics were removed are
    /// removed; factories then run over the new tree for additions. Entities
    /// on unchanged structure stay bound and receive `config_changed`.
    ///
    /// `config_num` is the number that prompted the refresh; the number kept
    /// afterwards is the one the accessory reports with the fetched tree.
    #[instrument(skip(self), fields(pairing_id = %self.inner.pairing_id))]
    pub async fn async_refresh_entity_map(&self, config_num: u64) -> HomeKitResult<RegistryDiff> {
        let setup = self.inner.setup_lock.lock().await;
        if !self.state().is_ready() {
            return Err(HomeKitError::NotConnected(self.inner.pairing_id.clone()));
        }
        self.transition(ConnectionState::FetchingStructure)?;
        self.inner.refreshing.store(true, Ordering::Release);

        debug!(config_num, "Refreshing accessory structure");
        let fetched = {
            let _transport = self.inner.transport.lock().await;
            self.inner
                .pairing
                .list_accessories_and_characteristics()
                .await
        };
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("Failed to refresh accessory structure: {}", e);
                self.inner.refreshing.store(false, Ordering::Release);
                self.transition(ConnectionState::Ready)?;
                return Err(e);
            }
        };

        // The device's own number describes the tree just fetched
        let config_num = fetched.config_num;
        let new_registry = CharacteristicRegistry::new(fetched.accessories);
        let (diff, refreshed) =
            self.with_registry(|old| (old.diff(&new_registry), refreshed_values(old, &new_registry)));

        let doomed: Vec<Arc<HomeKitEntity>> = self
            .inner
            .entities
            .iter()
            .map(|e| e.value().clone())
            .filter(|entity| {
                diff.removes(&entity.key()) || entity.tracks_any(&diff.removed_characteristics)
            })
            .collect();
        for entity in &doomed {
            entity.remove();
        }

        {
            let _order = self
                .inner
                .dispatch_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner) = new_registry;
            if !refreshed.is_empty() {
                self.inner.hub.dispatch(&refreshed);
            }
        }

        self.inner.config_num.store(config_num, Ordering::Release);
        self.inner
            .cache
            .put(&self.inner.pairing_id, config_num, self.entity_map());
        self.detect_workarounds();
        self.inner.refreshing.store(false, Ordering::Release);
        self.transition(ConnectionState::Ready)?;
        info!(
            config_num,
            removed = doomed.len(),
            changed = diff.changed_characteristics.len(),
            "Accessory structure refreshed"
        );

        for entity in self.entities() {
            entity.config_changed(self);
        }
        let _ = self.inner.config_changed.send(config_num);
        self.add_entities();

        drop(setup);
        self.poll().await;
        Ok(diff)
    }

    // ==================== Teardown ====================

    /// Stop all activity and remove every entity
    ///
    /// Timers and the poll loop are cancelled first so nothing can touch the
    /// hub after it is cleared. The connection can be connected again later.
    #[instrument(skip(self), fields(pairing_id = %self.inner.pairing_id))]
    pub async fn unload(&self) {
        self.inner.unloading.store(true, Ordering::Release);
        let _setup = self.inner.setup_lock.lock().await;
        self.tasks().abort_all();

        let watched: Vec<CharacteristicKey> =
            self.inner.hub.watchable_keys().into_iter().collect();
        for entity in self.entities() {
            entity.remove();
        }
        self.inner.hub.clear();
        self.dispatch_guard().clear_claims();
        self.pending_subscribes().clear();
        self.inner
            .subscribe_scheduled
            .store(false, Ordering::Release);

        {
            let _transport = self.inner.transport.lock().await;
            if !watched.is_empty() {
                if let Err(e) = self.inner.pairing.unsubscribe(&watched).await {
                    debug!("Unsubscribe during unload failed: {}", e);
                }
            }
            if let Err(e) = self.inner.pairing.shutdown().await {
                warn!("Pairing shutdown failed: {}", e);
            }
        }

        self.set_available(false);
        let _ = self.transition(ConnectionState::Disconnected);
        self.inner.unloading.store(false, Ordering::Release);
        info!("HomeKit connection unloaded");
    }

    /// Whether any background task (poll loop, retry, subscribe) is alive
    pub fn has_pending_tasks(&self) -> bool {
        let tasks = self.tasks();
        let pending = [&tasks.poll, &tasks.retry, &tasks.subscribe]
            .into_iter()
            .flatten()
            .any(|handle| !handle.is_finished());
        pending
    }

    pub fn diagnostics(&self) -> ConnectionDiagnostics {
        let (accessories, characteristics) =
            self.with_registry(|r| (r.accessories().len(), r.characteristic_count()));
        ConnectionDiagnostics {
            pairing_id: self.inner.pairing_id.clone(),
            state: self.state(),
            available: self.available(),
            config_num: self.config_num(),
            accessories,
            characteristics,
            pollable: self.inner.hub.pollable_keys().len(),
            watchable: self.inner.hub.watchable_keys().len(),
            entities: self.inner.entities.len(),
            poll_failures: self.inner.poll_failures.load(Ordering::Acquire),
            retry_attempts: self.inner.retry_attempts.load(Ordering::Acquire),
            unreliable_serial_numbers: self.unreliable_serial_numbers(),
            last_successful_poll: *self
                .inner
                .last_poll
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_guard(&self) -> std::sync::MutexGuard<'_, EntityFactoryDispatch> {
        self.inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_subscribes(&self) -> std::sync::MutexGuard<'_, BTreeSet<CharacteristicKey>> {
        self.inner
            .pending_subscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for AccessoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessoryConnection")
            .field("pairing_id", &self.inner.pairing_id)
            .field("state", &self.state())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_serial_number() {
        assert!(!valid_serial_number(None));
        assert!(!valid_serial_number(Some("")));
        assert!(!valid_serial_number(Some("0")));
        assert!(!valid_serial_number(Some("1")));
        assert!(!valid_serial_number(Some("0.1")));
        assert!(valid_serial_number(Some("1.0")));
        assert!(valid_serial_number(Some("2")));
        assert!(valid_serial_number(Some("1.2.3")));
        assert!(valid_serial_number(Some("AB1234")));
    }
}
