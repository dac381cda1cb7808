//! The worker pool: `config.worker_count` coroutines pulling fiber jobs
//! off a shared queue (spec §4.7).
//!
//! Grounded on this workspace's original scheduler's strand lifecycle
//! bookkeeping (`ACTIVE_STRANDS`/`TOTAL_SPAWNED`/`TOTAL_COMPLETED`
//! atomics) adapted from "spawn one coroutine per strand, track it in a
//! lock-free registry" to "spawn `worker_count` long-lived coroutines,
//! each pulling `FiberJob`s off one shared `may::sync::mpmc` queue" —
//! Gab schedules fibers cooperatively onto a fixed worker pool rather
//! than giving each one its own coroutine for the process lifetime.
//! Drops the original's `extern "C"` entry points and raw
//! `Stack`/`StackNode` pointer plumbing entirely: a fiber here starts
//! from a safe Rust closure over a [`FiberJob`], not a
//! compiler-generated function pointer crossing an FFI boundary.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use may::coroutine;
use may::sync::mpmc;
use tracing::{debug, trace};

use gab_core::value::BlockData;
use gab_core::Value;

use crate::engine::Engine;
use crate::fiber::{FiberHandle, FiberJob, FiberOutcome};
use crate::vm::Vm;

pub static ACTIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);
pub static TOTAL_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_COMPLETED: AtomicU64 = AtomicU64::new(0);

/// A job bundled with the engine it runs against; the queue's element
/// type must be `'static` to cross into a worker coroutine, so the
/// `Arc<Engine>` travels with the job rather than being captured from
/// the enclosing scope.
enum Task {
    Run(Arc<Engine>, FiberJob),
    Shutdown,
}

/// Owns the shared job queue; worker coroutines are spawned once at
/// construction and run until every sender is dropped or `shutdown` is
/// called.
pub struct Scheduler {
    sender: Option<mpmc::Sender<Task>>,
    worker_count: usize,
    /// Join handles for the coroutines spawned in [`Scheduler::new`], so
    /// [`Scheduler::shutdown`] can wait for every worker to actually
    /// drain its last job before the engine frees anything underneath
    /// it.
    workers: Mutex<Vec<coroutine::JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns `worker_count` coroutines, each looping on the shared
    /// queue until it sees [`Task::Shutdown`] or the channel closes.
    pub fn new(worker_count: usize) -> Arc<Scheduler> {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpmc::channel::<Task>();
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let handle = unsafe {
                coroutine::spawn(move || {
                    trace!(worker_id, "worker started");
                    loop {
                        match receiver.recv() {
                            Ok(Task::Run(engine, job)) => run_job(worker_id, &engine, job),
                            Ok(Task::Shutdown) | Err(_) => break,
                        }
                    }
                    trace!(worker_id, "worker stopped");
                })
            };
            workers.push(handle);
        }
        Arc::new(Scheduler {
            sender: Some(sender),
            worker_count,
            workers: Mutex::new(workers),
        })
    }

    /// A scheduler with no coroutine pool, for tests that run a fiber
    /// inline on the calling thread via [`Scheduler::spawn_fiber`].
    pub fn new_inline() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            sender: None,
            worker_count: 1,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Enqueues `block` as a new fiber and returns a handle the caller
    /// can [`FiberHandle::join`]. With no worker pool (`new_inline`),
    /// runs the fiber synchronously on the calling thread instead.
    pub fn spawn_fiber(&self, engine: Arc<Engine>, block: Arc<BlockData>, args: Vec<Value>) -> FiberHandle {
        let (job, handle) = FiberJob::new(block, args);
        TOTAL_SPAWNED.fetch_add(1, Ordering::Relaxed);
        ACTIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        match &self.sender {
            Some(sender) => {
                let _ = sender.send(Task::Run(engine, job));
            }
            None => run_job(0, &engine, job),
        }
        handle
    }

    /// Tells every worker to stop after its current job and blocks until
    /// all of them have. Idempotent: a second call finds an empty
    /// worker list and is a no-op beyond the shutdown signal.
    pub fn shutdown(&self) {
        if let Some(sender) = &self.sender {
            for _ in 0..self.worker_count {
                let _ = sender.send(Task::Shutdown);
            }
        }
        let mut workers = self.workers.lock().expect("scheduler worker list poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!(
            total_spawned = TOTAL_SPAWNED.load(Ordering::Relaxed),
            total_completed = TOTAL_COMPLETED.load(Ordering::Relaxed),
            "scheduler shutdown"
        );
    }
}

fn run_job(worker_id: usize, engine: &Engine, job: FiberJob) {
    trace!(worker_id, fiber = job.handle.id, "fiber starting");
    let mut vm = Vm::new(worker_id);
    let outcome = match vm.run(engine, job.block.clone(), job.args.clone()) {
        Ok(value) => FiberOutcome::Done(value),
        Err(err) => FiberOutcome::Failed(err),
    };
    job.complete(outcome);
    ACTIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
    TOTAL_COMPLETED.fetch_add(1, Ordering::Relaxed);
    trace!(worker_id, fiber = job.handle.id, "fiber finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use gab_core::value::PrototypeData;

    #[test]
    fn new_inline_has_one_worker_and_no_sender() {
        let sched = Scheduler::new_inline();
        assert_eq!(sched.worker_count(), 1);
        assert!(sched.sender.is_none());
    }

    #[test]
    fn spawn_fiber_on_inline_scheduler_runs_synchronously_and_joins() {
        let engine = Arc::new(Engine::new_for_test(EngineConfig::default()));
        let mut chunk = gab_compiler::opcode::Chunk::new();
        chunk.push_return(1, gab_compiler::opcode::SendFlags::default(), 0);
        let block = Arc::new(BlockData {
            prototype: Arc::new(PrototypeData {
                name: Value::undefined(),
                narguments: 1,
                nslots: 1,
                nupvalues: 0,
                bytecode: chunk.bytecode,
                tokens: chunk.tokens,
                constants: Vec::new(),
                upvalue_is_local: Vec::new(),
                upvalue_index: Vec::new(),
                send_cache: Vec::new(),
            }),
            upvalues: Vec::new(),
            nested: Arc::new(Vec::new()),
        });
        let handle = engine.scheduler.clone().spawn_fiber(engine.clone(), block, vec![Value::from_f64(7.0)]);
        let result = handle.join().unwrap();
        let Some(gab_core::HeapObject::Record(r)) = result.heap_object() else {
            panic!("fiber result must be a [ok, value] tuple");
        };
        assert_eq!(r.get_at(0).unwrap().sigil_id(), Some(engine.ok_sigil_id));
        assert_eq!(r.get_at(1).unwrap().as_f64(), Some(7.0));
    }

    #[test]
    fn shutdown_joins_every_worker() {
        let sched = Scheduler::new(2);
        sched.shutdown();
        assert!(sched.workers.lock().unwrap().is_empty());
    }
}
