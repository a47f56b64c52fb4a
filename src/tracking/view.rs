//! View Binding
//!
//! Exposes a store's snapshot to the rendering layer. Rendering code either
//! registers an observer, called synchronously after every successful
//! upsert or reset, or holds a `watch` receiver for async consumers.
//! Intermediate snapshots are not buffered: the latest one is always
//! readable through [`ViewBinding::snapshot`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::store::LocationStore;
use super::types::LocationUpdate;

/// Identifies a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Shared, cloneable handle on a store plus its observers
pub struct ViewBinding<S: LocationStore> {
    shared: Arc<Shared<S>>,
}

struct Shared<S: LocationStore> {
    /// Serializes mutate-then-notify so observers see snapshots in store order
    delivery: Mutex<()>,
    store: Mutex<S>,
    observers: Mutex<Vec<(ObserverId, Observer<S::Snapshot>)>>,
    next_observer: AtomicU64,
    channel: watch::Sender<S::Snapshot>,
}

impl<S: LocationStore> Clone for ViewBinding<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: LocationStore> Default for ViewBinding<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LocationStore> ViewBinding<S> {
    pub fn new() -> Self {
        let store = S::default();
        let (channel, _) = watch::channel(store.snapshot());

        Self {
            shared: Arc::new(Shared {
                delivery: Mutex::new(()),
                store: Mutex::new(store),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                channel,
            }),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> S::Snapshot {
        self.shared.store.lock().snapshot()
    }

    /// Register an observer; it must not mutate this binding
    pub fn subscribe(&self, observer: impl Fn(&S::Snapshot) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        self.shared.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers.lock();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    /// Receiver that always holds the latest snapshot
    pub fn watch(&self) -> watch::Receiver<S::Snapshot> {
        self.shared.channel.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().len()
    }

    /// Admit an update unconditionally
    pub fn upsert(&self, update: LocationUpdate) -> S::Snapshot {
        let _delivery = self.shared.delivery.lock();
        let snapshot = {
            let mut store = self.shared.store.lock();
            let snapshot = store.upsert(update);
            self.shared.channel.send_replace(snapshot.clone());
            snapshot
        };
        self.notify(&snapshot);
        snapshot
    }

    /// Admit an update only if `admit` holds
    ///
    /// `admit` runs under the store lock, so it cannot interleave with
    /// [`reset_with`](Self::reset_with).
    pub fn upsert_guarded(
        &self,
        update: LocationUpdate,
        admit: impl FnOnce() -> bool,
    ) -> Option<S::Snapshot> {
        let _delivery = self.shared.delivery.lock();
        let snapshot = {
            let mut store = self.shared.store.lock();
            if !admit() {
                return None;
            }
            let snapshot = store.upsert(update);
            self.shared.channel.send_replace(snapshot.clone());
            snapshot
        };
        self.notify(&snapshot);
        Some(snapshot)
    }

    /// Clear the store, running `before_clear` under the store lock first
    pub fn reset_with<R>(&self, before_clear: impl FnOnce() -> R) -> R {
        let _delivery = self.shared.delivery.lock();
        let (result, snapshot) = {
            let mut store = self.shared.store.lock();
            let result = before_clear();
            let snapshot = store.clear();
            self.shared.channel.send_replace(snapshot.clone());
            (result, snapshot)
        };
        self.notify(&snapshot);
        result
    }

    pub fn reset(&self) {
        self.reset_with(|| ());
    }

    fn notify(&self, snapshot: &S::Snapshot) {
        let observers: Vec<_> = self
            .shared
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            observer(snapshot);
        }
    }
}
