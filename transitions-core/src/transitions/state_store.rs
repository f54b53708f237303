//! Object lifecycle state store

use crate::models::transition::ObjectRef;
use anyhow::Result;
use dashmap::DashMap;

/// Access to the lifecycle field of objects owned by other subsystems
pub trait ObjectStateStore: Send + Sync {
    /// Current state, `None` when the object is unknown
    fn current_state(&self, object: &ObjectRef) -> Result<Option<String>>;

    /// Set `new` only if the object is still in `expected`
    ///
    /// Returns `false` without writing when the state moved on.
    fn compare_and_set(&self, object: &ObjectRef, expected: &str, new: &str) -> Result<bool>;
}

/// Single-process state store
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: DashMap<ObjectRef, String>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite an object's state
    pub fn set_state(&self, object: ObjectRef, state: impl Into<String>) {
        self.states.insert(object, state.into());
    }

    pub fn state(&self, object: &ObjectRef) -> Option<String> {
        self.states.get(object).map(|entry| entry.value().clone())
    }
}

impl ObjectStateStore for InMemoryStateStore {
    fn current_state(&self, object: &ObjectRef) -> Result<Option<String>> {
        Ok(self.state(object))
    }

    fn compare_and_set(&self, object: &ObjectRef, expected: &str, new: &str) -> Result<bool> {
        // get_mut holds the shard write lock across the check and the write
        match self.states.get_mut(object) {
            Some(mut entry) if entry.value() == expected => {
                *entry.value_mut() = new.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_and_set() {
        let store = InMemoryStateStore::new();
        let object = ObjectRef::new("asset", "1");
        store.set_state(object.clone(), "new");

        assert!(!store.compare_and_set(&object, "retired", "in_use").unwrap());
        assert_eq!(store.state(&object).as_deref(), Some("new"));

        assert!(store.compare_and_set(&object, "new", "in_use").unwrap());
        assert_eq!(store.current_state(&object).unwrap().as_deref(), Some("in_use"));
    }

    #[test]
    fn test_unknown_object() {
        let store = InMemoryStateStore::new();
        let object = ObjectRef::new("asset", "404");
        assert_eq!(store.current_state(&object).unwrap(), None);
        assert!(!store.compare_and_set(&object, "new", "in_use").unwrap());
    }
}
