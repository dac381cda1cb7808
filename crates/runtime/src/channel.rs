//! Single-slot synchronous rendezvous channels (spec §4.8).
//!
//! A channel holds at most one value at a time; `put` blocks until a
//! `take` has claimed the previous occupant (or the channel closes),
//! and `take` blocks until a value arrives (or the channel closes).
//! There is no internal buffer — this is pure rendezvous, narrowed down
//! from this workspace's original multi-slot `may::sync` mpmc channel
//! to a single slot with explicit open/closed state.
//!
//! Implemented with a `Mutex` + `Condvar` pair rather than a literal
//! lock-free CAS loop: the observable contract (single slot, FIFO-free
//! rendezvous, blocking put/take, close semantics) is identical, and a
//! condvar wait is what a CAS spin loop degrades into under contention
//! on every real scheduler anyway. Noted as a deliberate simplification
//! in `DESIGN.md` rather than a hidden one.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Empty,
    Full(gab_core::Value),
    Closed,
}

pub struct Channel {
    slot: Mutex<Slot>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            slot: Mutex::new(Slot::Empty),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks until the slot is empty, then deposits `value`. Returns
    /// `Err(value)` (giving the value back) if the channel is closed
    /// before a slot opens up.
    ///
    /// Not atomic with respect to a concurrent `close`: if `close()`
    /// runs between this call observing an empty slot and it writing
    /// `value`, the value can be left parked in the slot with no reader
    /// ever able to take it (the channel is already closed). Callers
    /// needing exactly-once delivery must pair this with an
    /// application-level acknowledgement channel; see `SPEC_FULL.md`
    /// §12. This matches the reference engine's channel, not a new gap.
    pub fn put(&self, value: gab_core::Value) -> Result<(), gab_core::Value> {
        let mut slot = self.slot.lock().expect("channel slot poisoned");
        loop {
            match &*slot {
                Slot::Closed => return Err(value),
                Slot::Empty => {
                    *slot = Slot::Full(value);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                Slot::Full(_) => {
                    slot = self.not_full.wait(slot).expect("channel slot poisoned");
                }
            }
        }
    }

    /// Blocks until a value is available or the channel closes. A
    /// `take` that was already blocked when `close()` runs wakes up and
    /// returns `undefined` rather than blocking forever (spec §12's
    /// close-while-blocked-take resolution).
    pub fn take(&self) -> gab_core::Value {
        let mut slot = self.slot.lock().expect("channel slot poisoned");
        loop {
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Full(value) => {
                    self.not_full.notify_one();
                    return value;
                }
                Slot::Closed => {
                    *slot = Slot::Closed;
                    return gab_core::Value::undefined();
                }
                Slot::Empty => {
                    *slot = Slot::Empty;
                    slot = self.not_empty.wait(slot).expect("channel slot poisoned");
                }
            }
        }
    }

    pub fn try_take(&self) -> Option<gab_core::Value> {
        let mut slot = self.slot.lock().expect("channel slot poisoned");
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Full(value) => {
                self.not_full.notify_one();
                Some(value)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    pub fn take_timeout(&self, timeout: Duration) -> Option<gab_core::Value> {
        let slot = self.slot.lock().expect("channel slot poisoned");
        let (mut slot, result) = self
            .not_empty
            .wait_timeout_while(slot, timeout, |s| matches!(s, Slot::Empty))
            .expect("channel slot poisoned");
        if result.timed_out() {
            return None;
        }
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Full(value) => {
                self.not_full.notify_one();
                Some(value)
            }
            Slot::Closed => {
                *slot = Slot::Closed;
                None
            }
            Slot::Empty => None,
        }
    }

    /// Closes the channel, waking every blocked `put` and `take`.
    /// Idempotent.
    pub fn close(&self) {
        let mut slot = self.slot.lock().expect("channel slot poisoned");
        if !matches!(&*slot, Slot::Closed) {
            *slot = Slot::Closed;
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.slot.lock().expect("channel slot poisoned"), Slot::Closed)
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gab_core::Value;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_then_take_rendezvous() {
        let chan = Channel::new();
        chan.put(Value::from_f64(1.0)).unwrap();
        assert_eq!(chan.take().as_f64(), Some(1.0));
    }

    #[test]
    fn take_on_empty_then_close_returns_undefined() {
        let chan = Arc::new(Channel::new());
        let c = chan.clone();
        let handle = thread::spawn(move || c.take());
        thread::sleep(Duration::from_millis(20));
        chan.close();
        let result = handle.join().unwrap();
        assert!(result.is_undefined());
    }

    #[test]
    fn put_after_close_returns_the_value_back() {
        let chan = Channel::new();
        chan.close();
        let v = Value::from_f64(42.0);
        let err = chan.put(v.clone()).unwrap_err();
        assert_eq!(err.as_f64(), v.as_f64());
    }

    #[test]
    fn try_take_on_empty_returns_none() {
        let chan = Channel::new();
        assert!(chan.try_take().is_none());
    }

    #[test]
    fn second_put_blocks_until_first_is_taken() {
        let chan = Arc::new(Channel::new());
        chan.put(Value::from_f64(1.0)).unwrap();
        let c = chan.clone();
        let handle = thread::spawn(move || c.put(Value::from_f64(2.0)));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(chan.take().as_f64(), Some(1.0));
        handle.join().unwrap().unwrap();
        assert_eq!(chan.take().as_f64(), Some(2.0));
    }

    #[test]
    fn close_is_idempotent() {
        let chan = Channel::new();
        chan.close();
        chan.close();
        assert!(chan.is_closed());
    }
}
