//! The apply/revert model of cached resource values.
//!
//! The free functions implement the structural contract on plain values:
//!
//! - [`apply_change`] sets model properties and returns the revert map. A
//!   property that did not exist before reverts to the delete tombstone, so
//!   applying the revert map restores the exact prior state.
//! - [`apply_add`] and [`apply_remove`] insert into and remove from an ordered
//!   collection, rejecting out-of-range indices.
//!
//! [`ValueCache`] keeps a map of resource ID to [`CachedValue`] and adds the
//! existence bracket of create and delete on top of those functions. Handlers
//! can wire it in with [`Handler::with_cache`](crate::Handler::with_cache).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use resmesh_core::{delete_action, is_delete_action};
use serde_json::{Map, Value};

use crate::error::{EventError, EventResult};

/// A cached resource value.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    /// A model: properties by name.
    Model(Map<String, Value>),
    /// A collection: ordered values.
    Collection(Vec<Value>),
}

impl CachedValue {
    /// Builds a cached value from JSON. Objects become models and arrays
    /// become collections.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self::Model(map)),
            Value::Array(items) => Some(Self::Collection(items)),
            _ => None,
        }
    }

    /// Converts the cached value back into JSON.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Model(map) => Value::Object(map.clone()),
            Self::Collection(items) => Value::Array(items.clone()),
        }
    }
}

/// Applies `changes` to `model` and returns the revert map.
///
/// Properties set to the delete tombstone are removed. Changes that leave a
/// property unchanged are not part of the revert map.
pub fn apply_change(model: &mut Map<String, Value>, changes: &Map<String, Value>) -> Map<String, Value> {
    let mut revert = Map::new();
    for (key, new) in changes {
        if is_delete_action(new) {
            if let Some(old) = model.remove(key) {
                revert.insert(key.clone(), old);
            }
            continue;
        }
        match model.insert(key.clone(), new.clone()) {
            Some(old) if old == *new => {}
            Some(old) => {
                revert.insert(key.clone(), old);
            }
            None => {
                revert.insert(key.clone(), delete_action());
            }
        }
    }
    revert
}

/// Inserts `value` at `idx`. Requires `idx <= len`.
pub fn apply_add(items: &mut Vec<Value>, value: Value, idx: usize) -> EventResult<()> {
    if idx > items.len() {
        return Err(EventError::OutOfRange {
            idx,
            len: items.len(),
        });
    }
    items.insert(idx, value);
    Ok(())
}

/// Removes and returns the value at `idx`. Requires `idx < len`.
pub fn apply_remove(items: &mut Vec<Value>, idx: usize) -> EventResult<Value> {
    if idx >= items.len() {
        return Err(EventError::OutOfRange {
            idx,
            len: items.len(),
        });
    }
    Ok(items.remove(idx))
}

// =============================================================================
// ValueCache
// =============================================================================

/// A shared in-memory store of cached resource values, keyed by resource ID.
///
/// Every mutation of an entry must happen on that resource's group lane.
#[derive(Clone, Default)]
pub struct ValueCache {
    entries: Arc<Mutex<HashMap<String, CachedValue>>>,
}

impl ValueCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing any previous one.
    pub fn insert(&self, rid: impl Into<String>, value: CachedValue) {
        self.entries.lock().insert(rid.into(), value);
    }

    /// Returns a copy of the cached value.
    pub fn get(&self, rid: &str) -> Option<CachedValue> {
        self.entries.lock().get(rid).cloned()
    }

    /// Returns `true` if a value is cached for `rid`.
    pub fn contains(&self, rid: &str) -> bool {
        self.entries.lock().contains_key(rid)
    }

    /// Removes a value without going through the delete contract.
    pub fn remove(&self, rid: &str) -> Option<CachedValue> {
        self.entries.lock().remove(rid)
    }

    /// Number of cached resources.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Applies a change to a cached model and returns the revert map.
    pub fn apply_change(&self, rid: &str, changes: &Map<String, Value>) -> EventResult<Map<String, Value>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(rid) {
            Some(CachedValue::Model(model)) => Ok(apply_change(model, changes)),
            Some(CachedValue::Collection(_)) => Err(type_mismatch("change", rid)),
            None => Err(EventError::NotCreated(rid.to_string())),
        }
    }

    /// Inserts into a cached collection.
    pub fn apply_add(&self, rid: &str, value: &Value, idx: usize) -> EventResult<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(rid) {
            Some(CachedValue::Collection(items)) => apply_add(items, value.clone(), idx),
            Some(CachedValue::Model(_)) => Err(type_mismatch("add", rid)),
            None => Err(EventError::NotCreated(rid.to_string())),
        }
    }

    /// Removes from a cached collection and returns the removed value.
    pub fn apply_remove(&self, rid: &str, idx: usize) -> EventResult<Value> {
        let mut entries = self.entries.lock();
        match entries.get_mut(rid) {
            Some(CachedValue::Collection(items)) => apply_remove(items, idx),
            Some(CachedValue::Model(_)) => Err(type_mismatch("remove", rid)),
            None => Err(EventError::NotCreated(rid.to_string())),
        }
    }

    /// Creates a cached value from `data`.
    pub fn apply_create(&self, rid: &str, data: &Value) -> EventResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(rid) {
            return Err(EventError::AlreadyCreated(rid.to_string()));
        }
        let value = CachedValue::from_json(data.clone()).ok_or_else(|| {
            EventError::InvalidData(format!("'{rid}' must be created from an object or an array"))
        })?;
        entries.insert(rid.to_string(), value);
        Ok(())
    }

    /// Deletes a cached value and returns its data.
    pub fn apply_delete(&self, rid: &str) -> EventResult<Value> {
        self.entries
            .lock()
            .remove(rid)
            .map(|value| value.to_json())
            .ok_or_else(|| EventError::NotCreated(rid.to_string()))
    }
}

impl std::fmt::Debug for ValueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCache")
            .field("entries", &self.len())
            .finish()
    }
}

fn type_mismatch(event: &'static str, rid: &str) -> EventError {
    EventError::TypeMismatch {
        event,
        rid: rid.to_string(),
    }
}
