//! Shared variables visible to every capability an agent invokes.
//!
//! A [`SharedVariables`] is a cheap handle; clones point at the same map.
//! Delegated sub-agents receive the parent's handle, so mutations made deep
//! in the tree are visible to the ancestors once the delegation returns.
//! Guards are never exposed, so no lock can be held across an `.await`.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

#[derive(Clone, Default)]
pub struct SharedVariables {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl SharedVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Insert `value`, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.write().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.read().clone()
    }

    /// Mutate the map in place under a single write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.inner.write())
    }

    /// Merge `other` into this map, overwriting existing keys.
    pub fn extend(&self, other: Map<String, Value>) {
        self.inner.write().extend(other);
    }

    /// Whether both handles point at the same map.
    pub fn same_as(&self, other: &SharedVariables) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedVariables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedVariables")
            .field(&*self.inner.read())
            .finish()
    }
}
