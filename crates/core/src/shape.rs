//! Shapes: the ordered key-set every [`crate::record::RecordData`] is
//! stamped with (spec §3.3).
//!
//! A shape is immutable once created and is itself interned — two records
//! built with the same keys in the same order share a `ShapeId`. Deriving
//! a new shape from an existing one (adding one more key) is cached on the
//! parent shape, the same hidden-class "transition" trick used by dynamic
//! object systems to make `make`/property-addition fast without rehashing
//! every time.

use std::sync::Mutex;

/// `ShapeData` lives once per distinct key ordering; `Value::shape` wraps
/// it in an `Arc<HeapObject>` the same as every other heap kind.
#[derive(Debug)]
pub struct ShapeData {
    /// Message (property name) ids, in definition order.
    pub keys: Vec<u32>,
    /// The shape this one was derived from by appending `keys.last()`,
    /// if any. `None` for the empty root shape.
    pub parent: Option<u32>,
    /// Cache of "add this key" transitions already computed from this
    /// shape, keyed by the message id being added. Guarded by a mutex
    /// because transitions are discovered lazily from many fibers.
    transitions: Mutex<Vec<(u32, u32)>>,
}

impl ShapeData {
    pub fn root() -> Self {
        ShapeData {
            keys: Vec::new(),
            parent: None,
            transitions: Mutex::new(Vec::new()),
        }
    }

    pub fn derive(parent_id: u32, parent_keys: &[u32], key: u32) -> Self {
        let mut keys = Vec::with_capacity(parent_keys.len() + 1);
        keys.extend_from_slice(parent_keys);
        keys.push(key);
        ShapeData {
            keys,
            parent: Some(parent_id),
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Looks up an already-cached "append `key`" transition from this
    /// shape, if one has been taken before.
    pub fn cached_transition(&self, key: u32) -> Option<u32> {
        let transitions = self.transitions.lock().expect("shape transition cache poisoned");
        transitions.iter().find(|(k, _)| *k == key).map(|(_, id)| *id)
    }

    pub fn cache_transition(&self, key: u32, shape_id: u32) {
        let mut transitions = self.transitions.lock().expect("shape transition cache poisoned");
        if !transitions.iter().any(|(k, _)| *k == key) {
            transitions.push((key, shape_id));
        }
    }

    pub fn index_of(&self, key: u32) -> Option<usize> {
        self.keys.iter().position(|&k| k == key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The shape registry: interns shape key-sequences (via
/// [`crate::intern::ShapeTable`]) and caches the derivation graph between
/// them so `record.put(:x, v)` on a hot path resolves to a shape id
/// without rehashing the whole key list.
pub struct ShapeRegistry {
    shapes: Mutex<Vec<std::sync::Arc<ShapeData>>>,
    root_id: u32,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        let root = std::sync::Arc::new(ShapeData::root());
        ShapeRegistry {
            shapes: Mutex::new(vec![root]),
            root_id: 0,
        }
    }

    pub fn root(&self) -> u32 {
        self.root_id
    }

    pub fn get(&self, id: u32) -> std::sync::Arc<ShapeData> {
        self.shapes.lock().expect("shape registry poisoned")[id as usize].clone()
    }

    /// Returns the shape produced by appending `key` to `shape_id`
    /// (spec §3.3's `shape_with(s,k)`), creating and caching it if this
    /// is the first time that transition has been taken from
    /// `shape_id`. If `shape_id` already contains `key`, returns
    /// `shape_id` itself unchanged — re-sending an already-present key
    /// (e.g. a repeated field in a record literal) must not produce a
    /// different shape.
    pub fn transition(&self, shape_id: u32, key: u32) -> u32 {
        let parent = self.get(shape_id);
        if parent.index_of(key).is_some() {
            return shape_id;
        }
        if let Some(cached) = parent.cached_transition(key) {
            return cached;
        }
        let child = ShapeData::derive(shape_id, &parent.keys, key);
        let mut shapes = self.shapes.lock().expect("shape registry poisoned");
        let new_id = shapes.len() as u32;
        shapes.push(std::sync::Arc::new(child));
        drop(shapes);
        parent.cache_transition(key, new_id);
        new_id
    }

    /// Returns the shape produced by removing `key` from `shape_id`
    /// (spec §3.3's `shape_without(s,k)`), mirroring a persistent map's
    /// dissoc: rebuild the key list without `key`, preserving the
    /// relative order of the rest, and intern it as an ordinary shape
    /// reached by re-deriving from the root one key at a time. If
    /// `shape_id` doesn't contain `key`, returns `shape_id` unchanged.
    pub fn transition_without(&self, shape_id: u32, key: u32) -> u32 {
        let shape = self.get(shape_id);
        if shape.index_of(key).is_none() {
            return shape_id;
        }
        let mut result = self.root_id;
        for &k in &shape.keys {
            if k != key {
                result = self.transition(result, k);
            }
        }
        result
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_shape_is_empty() {
        let reg = ShapeRegistry::new();
        assert!(reg.get(reg.root()).is_empty());
    }

    #[test]
    fn same_key_sequence_yields_same_shape() {
        let reg = ShapeRegistry::new();
        let root = reg.root();
        let a = reg.transition(reg.transition(root, 1), 2);
        let b = reg.transition(reg.transition(root, 1), 2);
        assert_eq!(a, b);
    }

    #[test]
    fn different_key_order_yields_different_shape() {
        let reg = ShapeRegistry::new();
        let root = reg.root();
        let a = reg.transition(reg.transition(root, 1), 2);
        let b = reg.transition(reg.transition(root, 2), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn transition_cache_is_reused() {
        let reg = ShapeRegistry::new();
        let root = reg.root();
        let first = reg.transition(root, 5);
        let second = reg.transition(root, 5);
        assert_eq!(first, second);
        // only one extra shape should have been allocated beyond root
        assert_eq!(reg.get(first).keys, vec![5]);
    }

    #[test]
    fn re_adding_an_already_present_key_returns_the_same_shape() {
        let reg = ShapeRegistry::new();
        let shape = reg.transition(reg.transition(reg.root(), 1), 2);
        assert_eq!(reg.transition(shape, 2), shape);
        assert_eq!(reg.transition(shape, 1), shape);
    }

    #[test]
    fn transition_without_removes_a_key_and_preserves_order_of_the_rest() {
        let reg = ShapeRegistry::new();
        let root = reg.root();
        let shape = reg.transition(reg.transition(reg.transition(root, 1), 2), 3);
        let without_2 = reg.transition_without(shape, 2);
        assert_eq!(reg.get(without_2).keys, vec![1, 3]);
    }

    #[test]
    fn transition_without_a_missing_key_is_a_no_op() {
        let reg = ShapeRegistry::new();
        let shape = reg.transition(reg.root(), 1);
        assert_eq!(reg.transition_without(shape, 99), shape);
    }
}
