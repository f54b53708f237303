//! Per-object exclusive locks
//!
//! At most one run may drive an object's action chain at a time. A lock is a
//! map entry from object to the owning run id; the guard removes it on drop,
//! so a chain that fails or panics still releases its object.

use crate::models::transition::ObjectRef;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ObjectLocks {
    held: Arc<DashMap<ObjectRef, Uuid>>,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `object` on behalf of `run_id`, or `None` if held
    pub fn try_acquire(&self, object: &ObjectRef, run_id: Uuid) -> Option<ObjectLockGuard> {
        match self.held.entry(object.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(run_id);
                Some(ObjectLockGuard {
                    held: Arc::clone(&self.held),
                    object: object.clone(),
                    run_id,
                })
            }
        }
    }

    /// Run currently holding the object's lock
    pub fn holder(&self, object: &ObjectRef) -> Option<Uuid> {
        self.held.get(object).map(|entry| *entry.value())
    }

    pub fn is_locked(&self, object: &ObjectRef) -> bool {
        self.held.contains_key(object)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

/// Releases the object lock when dropped
#[derive(Debug)]
pub struct ObjectLockGuard {
    held: Arc<DashMap<ObjectRef, Uuid>>,
    object: ObjectRef,
    run_id: Uuid,
}

impl ObjectLockGuard {
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }
}

impl Drop for ObjectLockGuard {
    fn drop(&mut self) {
        self.held
            .remove_if(&self.object, |_, holder| *holder == self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_guard_dropped() {
        let locks = ObjectLocks::new();
        let object = ObjectRef::new("asset", "1");
        let first = Uuid::new_v4();

        let guard = locks.try_acquire(&object, first).unwrap();
        assert_eq!(locks.holder(&object), Some(first));
        assert!(locks.try_acquire(&object, Uuid::new_v4()).is_none());

        drop(guard);
        assert!(!locks.is_locked(&object));
        assert!(locks.try_acquire(&object, Uuid::new_v4()).is_some());
    }

    #[test]
    fn test_locks_are_per_object() {
        let locks = ObjectLocks::new();
        let run_id = Uuid::new_v4();
        let _a = locks.try_acquire(&ObjectRef::new("asset", "1"), run_id).unwrap();
        let _b = locks.try_acquire(&ObjectRef::new("asset", "2"), run_id).unwrap();
        assert_eq!(locks.held_count(), 2);
    }
}
