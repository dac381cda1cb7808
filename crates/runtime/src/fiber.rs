//! Fibers: Gab's unit of concurrency (spec §4.7).
//!
//! A fiber is a block plus its arguments, run to completion on a
//! worker's `Vm`. Fibers communicate only through [`crate::channel`]s
//! or by `join`ing another fiber's result — there is no shared mutable
//! state between them beyond what a `Box` value explicitly exposes.
//! Grounded on this workspace's original strand lifecycle bookkeeping
//! (`scheduler::ACTIVE_STRANDS`/`TOTAL_SPAWNED`/registry pattern), minus
//! the `extern "C"` entry points: a fiber here is started from a safe
//! Rust closure, not a compiler-generated function pointer crossing an
//! FFI boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use gab_core::value::BlockData;
use gab_core::{GabError, Value};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub enum FiberOutcome {
    Done(Value),
    Failed(GabError),
}

struct FiberState {
    outcome: Mutex<Option<FiberOutcome>>,
    finished: Condvar,
}

/// A joinable reference to a fiber in flight. Cloning shares the same
/// underlying state, so any number of other fibers can `join` one
/// fiber's result.
#[derive(Clone)]
pub struct FiberHandle {
    pub id: u64,
    state: Arc<FiberState>,
}

impl FiberHandle {
    fn new() -> Self {
        FiberHandle {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(FiberState {
                outcome: Mutex::new(None),
                finished: Condvar::new(),
            }),
        }
    }

    fn finish(&self, outcome: FiberOutcome) {
        let mut slot = self.state.outcome.lock().expect("fiber outcome mutex poisoned");
        *slot = Some(outcome);
        self.state.finished.notify_all();
    }

    /// Blocks the calling fiber/thread until this fiber completes,
    /// returning its result or the `GabError` it failed with.
    pub fn join(&self) -> Result<Value, GabError> {
        let mut slot = self.state.outcome.lock().expect("fiber outcome mutex poisoned");
        while slot.is_none() {
            slot = self.state.finished.wait(slot).expect("fiber outcome mutex poisoned");
        }
        match slot.take().expect("checked Some above") {
            FiberOutcome::Done(v) => Ok(v),
            FiberOutcome::Failed(e) => Err(e),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.outcome.lock().expect("fiber outcome mutex poisoned").is_some()
    }
}

/// The work a scheduler hands to a worker: a fiber's starting block,
/// its arguments, and the handle other fibers use to observe the
/// result.
pub struct FiberJob {
    pub handle: FiberHandle,
    pub block: Arc<BlockData>,
    pub args: Vec<Value>,
}

impl FiberJob {
    pub fn new(block: Arc<BlockData>, args: Vec<Value>) -> (FiberJob, FiberHandle) {
        let handle = FiberHandle::new();
        (
            FiberJob {
                handle: handle.clone(),
                block,
                args,
            },
            handle,
        )
    }

    pub fn complete(&self, outcome: FiberOutcome) {
        self.handle.finish(outcome);
    }
}
