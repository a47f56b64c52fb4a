//! Location State Stores
//!
//! In-memory current-state holders. Two shapes exist:
//!
//! - [`SingleEntityState`]: the user view, at most one update
//! - [`MultiEntityState`]: the dispatch view, latest update per entity
//!
//! Every mutation yields a freshly allocated snapshot, so observers can tell
//! snapshots apart with `Arc::ptr_eq` instead of comparing contents.
//! Last delivered wins; timestamps are never compared.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{EntityId, LocationUpdate};

/// Current-state holder fed by decoded updates
pub trait LocationStore: Default + Send + 'static {
    /// Immutable view of the whole store at one point in time
    type Snapshot: Clone + Send + Sync + 'static;

    /// Admit an update and return the new snapshot
    fn upsert(&mut self, update: LocationUpdate) -> Self::Snapshot;

    /// Current snapshot
    fn snapshot(&self) -> Self::Snapshot;

    /// Drop all state and return the (empty) snapshot
    fn clear(&mut self) -> Self::Snapshot;
}

/// Holds the latest update for the single tracked shipment
#[derive(Debug, Default)]
pub struct SingleEntityState {
    current: Option<Arc<LocationUpdate>>,
}

impl LocationStore for SingleEntityState {
    type Snapshot = Option<Arc<LocationUpdate>>;

    fn upsert(&mut self, update: LocationUpdate) -> Self::Snapshot {
        self.current = Some(Arc::new(update));
        self.current.clone()
    }

    fn snapshot(&self) -> Self::Snapshot {
        self.current.clone()
    }

    fn clear(&mut self) -> Self::Snapshot {
        self.current = None;
        None
    }
}

/// Snapshot of every tracked shipment, keyed by entity id
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    entries: Arc<HashMap<EntityId, LocationUpdate>>,
}

impl FleetSnapshot {
    pub fn get(&self, id: EntityId) -> Option<&LocationUpdate> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current updates in no particular order
    pub fn values(&self) -> impl Iterator<Item = &LocationUpdate> {
        self.entries.values()
    }

    /// Current updates sorted by entity id, for stable rendering
    pub fn sorted(&self) -> Vec<LocationUpdate> {
        let mut all: Vec<_> = self.entries.values().cloned().collect();
        all.sort_by_key(LocationUpdate::entity_id);
        all
    }

    /// True when both snapshots are the same allocation
    pub fn ptr_eq(&self, other: &FleetSnapshot) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

/// Latest update per shipment for the dispatch view
#[derive(Debug, Default)]
pub struct MultiEntityState {
    current: FleetSnapshot,
}

impl LocationStore for MultiEntityState {
    type Snapshot = FleetSnapshot;

    fn upsert(&mut self, update: LocationUpdate) -> Self::Snapshot {
        // Copy, never mutate in place: earlier snapshots stay valid
        let mut next = HashMap::clone(&self.current.entries);
        next.insert(update.entity_id(), update);
        self.current = FleetSnapshot {
            entries: Arc::new(next),
        };
        self.current.clone()
    }

    fn snapshot(&self) -> Self::Snapshot {
        self.current.clone()
    }

    fn clear(&mut self) -> Self::Snapshot {
        self.current = FleetSnapshot::default();
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn update(id: EntityId, lat: f64, lon: f64) -> LocationUpdate {
        LocationUpdate::new(id, lat, lon, Utc::now()).unwrap()
    }

    #[test]
    fn test_single_starts_empty() {
        let store = SingleEntityState::default();
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn test_single_replaces_wholesale() {
        let mut store = SingleEntityState::default();
        let first = store.upsert(update(1, 10.0, 10.0).with_tracking_code("TR-1"));
        let second = store.upsert(update(1, 11.0, 11.0));

        let second = second.unwrap();
        assert_eq!(second.position(), (11.0, 11.0));
        // no merge with the previous value
        assert_eq!(second.tracking_code(), None);
        assert!(!Arc::ptr_eq(&first.unwrap(), &second));
    }

    #[test]
    fn test_multi_last_write_wins() {
        let mut store = MultiEntityState::default();
        store.upsert(update(1, 10.0, 10.0));
        store.upsert(update(2, 20.0, 20.0));
        let snapshot = store.upsert(update(1, 15.0, 15.0));

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(1).unwrap().position(), (15.0, 15.0));
        assert_eq!(snapshot.get(2).unwrap().position(), (20.0, 20.0));
    }

    #[test]
    fn test_multi_growth_bound() {
        let mut store = MultiEntityState::default();
        let ids = [3, 1, 3, 2, 1, 3, 3, 2];
        for (i, id) in ids.iter().enumerate() {
            store.upsert(update(*id, i as f64, 0.0));
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 3);
        // each entry is the most recently delivered update for its id
        assert_eq!(snapshot.get(1).unwrap().latitude(), 4.0);
        assert_eq!(snapshot.get(2).unwrap().latitude(), 7.0);
        assert_eq!(snapshot.get(3).unwrap().latitude(), 6.0);
    }

    #[test]
    fn test_multi_snapshots_are_distinct() {
        let mut store = MultiEntityState::default();
        let before = store.upsert(update(1, 10.0, 10.0));
        let after = store.upsert(update(1, 10.0, 10.0));

        assert!(!before.ptr_eq(&after));
        // the older snapshot is not affected by the later upsert
        assert_eq!(before.len(), 1);
        assert!(after.ptr_eq(&store.snapshot()));
    }

    #[test]
    fn test_clear() {
        let mut store = MultiEntityState::default();
        store.upsert(update(1, 10.0, 10.0));
        assert!(store.clear().is_empty());

        let mut single = SingleEntityState::default();
        single.upsert(update(1, 10.0, 10.0));
        assert!(single.clear().is_none());
    }

    #[test]
    fn test_sorted() {
        let mut store = MultiEntityState::default();
        for id in [5, 2, 9] {
            store.upsert(update(id, 0.0, 0.0));
        }
        let ids: Vec<_> = store.snapshot().sorted().iter().map(|u| u.entity_id()).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }
}
