//! Characteristic subscription hub
//!
//! Tracks which characteristics must be polled or event-subscribed, and fans
//! changed values out to listener callbacks.
//!
//! Interest is reference counted per key: two entities that both poll `1.8`
//! each add one count, and the key stays pollable until both remove theirs.
//! Every listener runs on its own task fed by an unbounded queue, so a slow
//! callback delays only itself and each listener sees values in dispatch order.

use dashmap::DashMap;
use ha_homekit_model::{CharacteristicKey, CharacteristicValue};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// Changed values delivered to a listener, restricted to its keys
pub type CharacteristicDelta = BTreeMap<CharacteristicKey, CharacteristicValue>;

/// Listener callback; must return quickly
pub type StateCallback = Arc<dyn Fn(&CharacteristicDelta) + Send + Sync>;

/// A unique identifier for a hub listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Listener {
    keys: HashSet<CharacteristicKey>,
    tx: mpsc::UnboundedSender<Arc<CharacteristicDelta>>,
}

/// Poll/event interest sets and listener fan-out for one connection
#[derive(Default)]
pub struct SubscriptionHub {
    pollable: DashMap<CharacteristicKey, usize>,
    watchable: DashMap<CharacteristicKey, usize>,
    listeners: DashMap<ListenerId, Listener>,
    by_key: DashMap<CharacteristicKey, HashSet<ListenerId>>,
    next_listener_id: AtomicU64,
}

fn add_counts(
    counts: &DashMap<CharacteristicKey, usize>,
    keys: impl IntoIterator<Item = CharacteristicKey>,
) -> Vec<CharacteristicKey> {
    let mut added = Vec::new();
    for key in keys {
        let mut count = counts.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 {
            added.push(key);
        }
    }
    added
}

fn remove_counts(
    counts: &DashMap<CharacteristicKey, usize>,
    keys: impl IntoIterator<Item = CharacteristicKey>,
) -> Vec<CharacteristicKey> {
    let mut removed = Vec::new();
    for key in keys {
        let gone = match counts.get_mut(&key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if gone && counts.remove_if(&key, |_, count| *count == 0).is_some() {
            removed.push(key);
        }
    }
    removed
}

impl SubscriptionHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add one poll interest per key; returns keys that just became pollable
    pub fn add_pollable(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
    ) -> Vec<CharacteristicKey> {
        add_counts(&self.pollable, keys)
    }

    /// Drop one poll interest per key; returns keys no longer pollable
    pub fn remove_pollable(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
    ) -> Vec<CharacteristicKey> {
        remove_counts(&self.pollable, keys)
    }

    /// Add one event interest per key; returns keys that need subscribing
    pub fn add_watchable(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
    ) -> Vec<CharacteristicKey> {
        add_counts(&self.watchable, keys)
    }

    /// Drop one event interest per key; returns keys that need unsubscribing
    pub fn remove_watchable(
        &self,
        keys: impl IntoIterator<Item = CharacteristicKey>,
    ) -> Vec<CharacteristicKey> {
        remove_counts(&self.watchable, keys)
    }

    pub fn pollable_keys(&self) -> BTreeSet<CharacteristicKey> {
        self.pollable.iter().map(|e| *e.key()).collect()
    }

    pub fn watchable_keys(&self) -> BTreeSet<CharacteristicKey> {
        self.watchable.iter().map(|e| *e.key()).collect()
    }

    pub fn is_pollable(&self, key: &CharacteristicKey) -> bool {
        self.pollable.contains_key(key)
    }

    pub fn is_watchable(&self, key: &CharacteristicKey) -> bool {
        self.watchable.contains_key(key)
    }

    /// Register a callback for changes to any of `keys`
    ///
    /// The callback runs on a task spawned here. Dropping the returned
    /// [`Subscription`] removes exactly this registration.
    ///
    /// # Panics
    ///
    /// Outside a Tokio runtime.
    pub fn subscribe(
        self: &Arc<Self>,
        keys: impl IntoIterator<Item = CharacteristicKey>,
        callback: StateCallback,
    ) -> Subscription {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        let keys: HashSet<CharacteristicKey> = keys.into_iter().collect();
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<CharacteristicDelta>>();

        tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                callback(&delta);
            }
        });

        for key in &keys {
            self.by_key.entry(*key).or_default().insert(id);
        }
        trace!(?id, keys = keys.len(), "Listener subscribed");
        self.listeners.insert(id, Listener { keys, tx });

        Subscription {
            hub: Arc::downgrade(self),
            id: Some(id),
        }
    }

    fn unsubscribe(&self, id: ListenerId) {
        let Some((_, listener)) = self.listeners.remove(&id) else {
            return;
        };
        for key in &listener.keys {
            if let Some(mut ids) = self.by_key.get_mut(key) {
                ids.remove(&id);
            }
            self.by_key.remove_if(key, |_, ids| ids.is_empty());
        }
        trace!(?id, "Listener unsubscribed");
    }

    /// Queue each listener's share of `changed`; returns listeners notified
    pub fn dispatch(&self, changed: &BTreeMap<CharacteristicKey, CharacteristicValue>) -> usize {
        let mut deltas: BTreeMap<ListenerId, CharacteristicDelta> = BTreeMap::new();

        for (key, value) in changed {
            let Some(ids) = self.by_key.get(key) else {
                continue;
            };
            for id in ids.iter() {
                deltas.entry(*id).or_default().insert(*key, value.clone());
            }
        }

        let mut notified = 0;
        for (id, delta) in deltas {
            if let Some(listener) = self.listeners.get(&id) {
                if listener.tx.send(Arc::new(delta)).is_ok() {
                    notified += 1;
                }
            }
        }
        trace!(changed = changed.len(), notified, "Dispatched values");
        notified
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop every interest and listener
    pub fn clear(&self) {
        self.pollable.clear();
        self.watchable.clear();
        self.listeners.clear();
        self.by_key.clear();
    }
}

/// One listener registration; unregisters on drop
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<SubscriptionHub>,
    id: Option<ListenerId>,
}

impl Subscription {
    pub fn id(&self) -> Option<ListenerId> {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(id), Some(hub)) = (self.id.take(), self.hub.upgrade()) {
            hub.unsubscribe(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Subscriptions owned together and released together
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn release_all(&mut self) {
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn key(aid: u64, iid: u64) -> CharacteristicKey {
        CharacteristicKey::new(aid, iid)
    }

    fn recorder() -> (StateCallback, Arc<Mutex<Vec<CharacteristicDelta>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: StateCallback = Arc::new(move |delta: &CharacteristicDelta| {
            sink.lock().unwrap().push(delta.clone());
        });
        (callback, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_pollable_refcount() {
        let hub = SubscriptionHub::new();
        assert_eq!(hub.add_pollable([key(1, 8), key(1, 9)]), vec![key(1, 8), key(1, 9)]);
        assert_eq!(hub.add_pollable([key(1, 8)]), vec![]);

        assert_eq!(hub.remove_pollable([key(1, 8)]), vec![]);
        assert!(hub.is_pollable(&key(1, 8)));

        assert_eq!(hub.remove_pollable([key(1, 8), key(1, 9)]), vec![key(1, 8), key(1, 9)]);
        assert!(hub.pollable_keys().is_empty());
    }

    #[test]
    fn test_remove_unknown_key_is_noop() {
        let hub = SubscriptionHub::new();
        assert!(hub.remove_watchable([key(1, 8)]).is_empty());
        assert!(hub.watchable_keys().is_empty());
    }

    #[test]
    fn test_poll_and_watch_sets_are_independent() {
        let hub = SubscriptionHub::new();
        hub.add_pollable([key(1, 8)]);
        hub.add_watchable([key(1, 8), key(1, 10)]);
        hub.remove_pollable([key(1, 8)]);

        assert!(hub.pollable_keys().is_empty());
        assert_eq!(hub.watchable_keys(), BTreeSet::from([key(1, 8), key(1, 10)]));
    }

    #[tokio::test]
    async fn test_fan_out_to_overlapping_listeners() {
        let hub = SubscriptionHub::new();
        let (cb_a, seen_a) = recorder();
        let (cb_b, seen_b) = recorder();
        let sub_a = hub.subscribe([key(1, 8)], cb_a);
        let _sub_b = hub.subscribe([key(1, 8), key(1, 9)], cb_b);

        let changed = BTreeMap::from([(key(1, 8), json!(true)), (key(1, 9), json!(50))]);
        assert_eq!(hub.dispatch(&changed), 2);
        settle().await;

        assert_eq!(
            seen_a.lock().unwrap().as_slice(),
            &[BTreeMap::from([(key(1, 8), json!(true))])]
        );
        assert_eq!(seen_b.lock().unwrap()[0], changed);

        sub_a.unsubscribe();
        hub.dispatch(&BTreeMap::from([(key(1, 8), json!(false))]));
        settle().await;

        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().len(), 2);
        assert_eq!(hub.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = SubscriptionHub::new();
        let (cb, seen) = recorder();
        {
            let _sub = hub.subscribe([key(1, 8)], cb);
            assert_eq!(hub.listener_count(), 1);
        }
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.dispatch(&BTreeMap::from([(key(1, 8), json!(1))])), 0);
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_listener_does_not_block_others() {
        let hub = SubscriptionHub::new();
        let slow: StateCallback = Arc::new(|_: &CharacteristicDelta| {
            std::thread::sleep(Duration::from_millis(200));
        });
        let (fast, seen) = recorder();
        let _slow = hub.subscribe([key(1, 8)], slow);
        let _fast = hub.subscribe([key(1, 8)], fast);

        hub.dispatch(&BTreeMap::from([(key(1, 8), json!(1))]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_per_listener_order() {
        let hub = SubscriptionHub::new();
        let (cb, seen) = recorder();
        let _sub = hub.subscribe([key(1, 8)], cb);

        for n in 0..20 {
            hub.dispatch(&BTreeMap::from([(key(1, 8), json!(n))]));
        }
        settle().await;

        let values: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|d| d[&key(1, 8)].clone())
            .collect();
        assert_eq!(values, (0..20).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_subscription_set_releases_together() {
        let hub = SubscriptionHub::new();
        let mut set = SubscriptionSet::new();
        set.push(hub.subscribe([key(1, 8)], recorder().0));
        set.push(hub.subscribe([key(1, 9)], recorder().0));
        assert_eq!(hub.listener_count(), 2);

        set.release_all();
        assert!(set.is_empty());
        assert_eq!(hub.listener_count(), 0);
    }
}
