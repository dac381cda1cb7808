//! Inline send-cache rows (spec §4.4, §4.5).
//!
//! Every `Send` site gets one [`SendCacheSlot`], allocated once when its
//! enclosing [`crate::value::PrototypeData`] is compiled and shared by
//! every closure built from that prototype (the row lives on the
//! prototype, not the closure). A polymorphic call site — one that sees
//! more than one receiver shape/kind over its lifetime — keeps up to
//! [`CACHE_LEN`] distinct `(key, target)` pairs instead of thrashing a
//! single slot back to a miss on every alternation; a hit promotes its
//! entry to the front so the most recently seen receivers stay cheapest
//! to re-probe. Redefining a message or reshaping a record invalidates
//! every entry that cached the stale mapping by construction: the key
//! simply stops matching on the next check, falling back to the generic
//! lookup the same way a cold cache would.

use std::sync::Mutex;

use crate::value::Value;

/// Sentinel `key` used for non-record receivers, where there is no
/// shape id to cache against — the kind itself is the specialization
/// key.
pub const NUMBER_CACHE_KEY: u32 = u32::MAX;
pub const STRING_CACHE_KEY: u32 = u32::MAX - 1;
pub const SIGIL_CACHE_KEY: u32 = u32::MAX - 2;
pub const CHANNEL_CACHE_KEY: u32 = u32::MAX - 3;
pub const FIBER_CACHE_KEY: u32 = u32::MAX - 4;

/// The backing capacity every `SendCacheSlot` allocates, matching
/// `cGAB_SEND_CACHE_LEN`'s default. `EngineConfig::send_cache_len` picks
/// how many of these a running engine actually uses (clamped to this
/// ceiling by [`SendCacheSlot::probe`]/[`SendCacheSlot::fill`]); it
/// can't grow the backing storage itself since the cache row is built
/// at compile time, before any `EngineConfig` exists.
pub const CACHE_LEN: usize = 4;

#[derive(Debug, Clone)]
struct CacheEntry {
    key: u32,
    target: Option<Value>,
}

#[derive(Debug, Default)]
struct PolyRow {
    /// Most-recently-used first. Never longer than [`CACHE_LEN`].
    entries: Vec<CacheEntry>,
}

/// A `Mutex`-guarded polymorphic cache row so `Arc<PrototypeData>`
/// (shared by every closure instantiated from it, across every worker)
/// can still update its cache without requiring `&mut`.
#[derive(Debug, Default)]
pub struct SendCacheSlot(Mutex<PolyRow>);

impl SendCacheSlot {
    pub fn new() -> Self {
        SendCacheSlot(Mutex::new(PolyRow::default()))
    }

    /// Returns the cached target for `key`, if this site has seen it
    /// before among its `len` live slots (`len` is
    /// `EngineConfig::send_cache_len`, clamped to [`CACHE_LEN`]). A hit
    /// promotes the entry to the front.
    pub fn probe(&self, key: u32, len: usize) -> Option<Value> {
        let len = len.clamp(1, CACHE_LEN);
        let mut row = self.0.lock().expect("send cache row poisoned");
        let pos = row.entries.iter().take(len).position(|e| e.key == key)?;
        let entry = row.entries.remove(pos);
        let target = entry.target.clone();
        row.entries.insert(0, entry);
        target
    }

    /// Records `key -> target` as this site's most recently seen
    /// specialization, evicting the least-recently-used entry once the
    /// row is at capacity.
    pub fn fill(&self, key: u32, target: Option<Value>, len: usize) {
        let len = len.clamp(1, CACHE_LEN);
        let mut row = self.0.lock().expect("send cache row poisoned");
        row.entries.retain(|e| e.key != key);
        row.entries.insert(0, CacheEntry { key, target });
        row.entries.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_never_hits() {
        let slot = SendCacheSlot::new();
        assert!(slot.probe(1, CACHE_LEN).is_none());
    }

    #[test]
    fn fill_then_matching_probe_hits() {
        let slot = SendCacheSlot::new();
        slot.fill(42, Some(Value::from_f64(7.0)), CACHE_LEN);
        assert_eq!(slot.probe(42, CACHE_LEN).unwrap().as_f64(), Some(7.0));
    }

    #[test]
    fn mismatched_key_misses_after_fill() {
        let slot = SendCacheSlot::new();
        slot.fill(1, Some(Value::from_f64(1.0)), CACHE_LEN);
        assert!(slot.probe(2, CACHE_LEN).is_none());
    }

    #[test]
    fn a_polymorphic_site_keeps_more_than_one_shape_live() {
        let slot = SendCacheSlot::new();
        slot.fill(1, Some(Value::from_f64(1.0)), CACHE_LEN);
        slot.fill(2, Some(Value::from_f64(2.0)), CACHE_LEN);
        slot.fill(3, Some(Value::from_f64(3.0)), CACHE_LEN);
        // All three fit under CACHE_LEN == 4, so the first fill's entry
        // is still here even though two more receivers have been seen
        // since — a single-slot monomorphic cache would have evicted it
        // after the second fill.
        assert_eq!(slot.probe(1, CACHE_LEN).unwrap().as_f64(), Some(1.0));
        assert_eq!(slot.probe(2, CACHE_LEN).unwrap().as_f64(), Some(2.0));
        assert_eq!(slot.probe(3, CACHE_LEN).unwrap().as_f64(), Some(3.0));
    }

    #[test]
    fn overflowing_capacity_evicts_the_least_recently_used_entry() {
        let slot = SendCacheSlot::new();
        for key in 0..CACHE_LEN as u32 {
            slot.fill(key, Some(Value::from_f64(key as f64)), CACHE_LEN);
        }
        // key 0 is now the least recently used; one more distinct key
        // pushes it out.
        slot.fill(CACHE_LEN as u32, Some(Value::from_f64(99.0)), CACHE_LEN);
        assert!(slot.probe(0, CACHE_LEN).is_none());
        assert!(slot.probe(CACHE_LEN as u32, CACHE_LEN).is_some());
    }

    #[test]
    fn a_smaller_configured_len_ignores_slots_beyond_it() {
        let slot = SendCacheSlot::new();
        slot.fill(1, Some(Value::from_f64(1.0)), CACHE_LEN);
        slot.fill(2, Some(Value::from_f64(2.0)), CACHE_LEN);
        // key 2 is most-recently-used (front); with a configured length
        // of 1, only the front slot is visible.
        assert!(slot.probe(1, 1).is_none());
        assert_eq!(slot.probe(2, 1).unwrap().as_f64(), Some(2.0));
    }
}
