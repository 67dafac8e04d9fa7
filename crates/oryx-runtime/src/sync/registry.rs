//! Global registry for all monitors and internal-lock ownership
//!
//! Besides the per-object monitors, the registry tracks ownership of the
//! two other lock kinds deadlock detection walks: internal (raw) runtime
//! locks and park-blocker objects.

use crate::object::ObjectId;
use crate::sync::monitor::{Monitor, MonitorId};
use crate::threads::ThreadId;
use dashmap::DashMap;
use std::sync::Arc;

/// Global registry of monitors and lock ownership
#[derive(Default)]
pub struct MonitorRegistry {
    /// Map of monitor ID to monitor instance
    monitors: DashMap<MonitorId, Arc<Monitor>>,
    /// Map of object ID to its monitor
    by_object: DashMap<ObjectId, MonitorId>,
    /// Owners of internal (raw) runtime locks
    raw_owners: DashMap<u64, ThreadId>,
    /// Exclusive owners of park-blocker objects
    park_owners: DashMap<ObjectId, ThreadId>,
}

impl MonitorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the monitor for an object
    pub fn monitor_for(&self, object: ObjectId) -> Arc<Monitor> {
        if let Some(id) = self.by_object.get(&object) {
            if let Some(m) = self.monitors.get(&id) {
                return m.clone();
            }
        }
        let monitor = Arc::new(Monitor::new(MonitorId::new(), object));
        self.monitors.insert(monitor.id(), monitor.clone());
        self.by_object.insert(object, monitor.id());
        monitor
    }

    /// Get a monitor by ID
    pub fn get(&self, id: MonitorId) -> Option<Arc<Monitor>> {
        self.monitors.get(&id).map(|entry| entry.clone())
    }

    /// Remove a monitor (object deflation/collection)
    pub fn remove(&self, id: MonitorId) -> Option<Arc<Monitor>> {
        let removed = self.monitors.remove(&id).map(|(_, m)| m);
        if let Some(m) = &removed {
            self.by_object.remove(&m.object());
        }
        removed
    }

    /// Number of registered monitors
    pub fn count(&self) -> usize {
        self.monitors.len()
    }

    /// Owner of a monitor, if any
    pub fn owner_of(&self, id: MonitorId) -> Option<ThreadId> {
        self.monitors.get(&id).and_then(|m| m.owner())
    }

    /// All monitors currently owned by a thread
    pub fn owned_by(&self, thread: ThreadId) -> Vec<MonitorId> {
        self.monitors
            .iter()
            .filter(|entry| entry.value().owner() == Some(thread))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Record the owner of an internal (raw) runtime lock
    pub fn set_raw_lock_owner(&self, lock: u64, owner: Option<ThreadId>) {
        match owner {
            Some(t) => {
                self.raw_owners.insert(lock, t);
            }
            None => {
                self.raw_owners.remove(&lock);
            }
        }
    }

    /// Owner of an internal lock, if any
    pub fn raw_lock_owner(&self, lock: u64) -> Option<ThreadId> {
        self.raw_owners.get(&lock).map(|entry| *entry.value())
    }

    /// Record the exclusive owner of a park-blocker object
    pub fn set_park_blocker_owner(&self, blocker: ObjectId, owner: Option<ThreadId>) {
        match owner {
            Some(t) => {
                self.park_owners.insert(blocker, t);
            }
            None => {
                self.park_owners.remove(&blocker);
            }
        }
    }

    /// Owner of a park-blocker object, if any
    pub fn park_blocker_owner(&self, blocker: ObjectId) -> Option<ThreadId> {
        self.park_owners.get(&blocker).map(|entry| *entry.value())
    }

    /// Clear all monitors (shutdown)
    pub fn clear(&self) {
        self.monitors.clear();
        self.by_object.clear();
        self.raw_owners.clear();
        self.park_owners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::VmThread;

    #[test]
    fn test_monitor_for_is_cached() {
        let registry = MonitorRegistry::new();
        let obj = ObjectId::new();
        let m1 = registry.monitor_for(obj);
        let m2 = registry.monitor_for(obj);
        assert_eq!(m1.id(), m2.id());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_owned_by() {
        let registry = MonitorRegistry::new();
        let t = VmThread::new("t");
        let m1 = registry.monitor_for(ObjectId::new());
        let m2 = registry.monitor_for(ObjectId::new());
        let _m3 = registry.monitor_for(ObjectId::new());
        m1.enter(&t);
        m2.enter(&t);

        let mut owned = registry.owned_by(t.id());
        owned.sort_by_key(|m| m.as_u64());
        let mut expected = vec![m1.id(), m2.id()];
        expected.sort_by_key(|m| m.as_u64());
        assert_eq!(owned, expected);
    }

    #[test]
    fn test_raw_and_park_ownership() {
        let registry = MonitorRegistry::new();
        let t = VmThread::new("t");

        registry.set_raw_lock_owner(7, Some(t.id()));
        assert_eq!(registry.raw_lock_owner(7), Some(t.id()));
        registry.set_raw_lock_owner(7, None);
        assert_eq!(registry.raw_lock_owner(7), None);

        let blocker = ObjectId::new();
        registry.set_park_blocker_owner(blocker, Some(t.id()));
        assert_eq!(registry.park_blocker_owner(blocker), Some(t.id()));
    }

    #[test]
    fn test_remove_monitor() {
        let registry = MonitorRegistry::new();
        let obj = ObjectId::new();
        let m = registry.monitor_for(obj);
        assert!(registry.remove(m.id()).is_some());
        assert_eq!(registry.count(), 0);
        // A new monitor is created on demand afterwards.
        let m2 = registry.monitor_for(obj);
        assert_ne!(m.id(), m2.id());
    }
}
