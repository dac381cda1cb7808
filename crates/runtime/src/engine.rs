//! The engine: the shared state every worker, fiber, and VM in one Gab
//! process sees (spec §2's "Engine" component).
//!
//! Owns the interned-value tables, the shape registry, the garbage
//! collector, and the scheduler's worker pool. `Engine::create` mirrors
//! the reference engine's `gab_create`/`gab_destroy` pairing —
//! `tracing` spans mark both so a host embedding Gab can see engine
//! lifetime in its logs the same way it already sees everything else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use gab_compiler::opcode::SendFlags;
use gab_core::cache::{CHANNEL_CACHE_KEY, FIBER_CACHE_KEY, NUMBER_CACHE_KEY, SIGIL_CACHE_KEY, STRING_CACHE_KEY};
use gab_core::value::{BlockData, ChannelData, FiberData, HeapObject};
use gab_core::{GabError, GabStatus, InternTables, RecordData, SendCacheSlot, ShapeRegistry, Value, ValueKind};
use tracing::{debug, info, instrument};

use crate::builtins;
use crate::channel::Channel;
use crate::config::{ConfigError, EngineConfig};
use crate::fiber::FiberHandle;
use crate::gc::Collector;
use crate::scheduler::Scheduler;
use crate::vm::Vm;

/// `(message, receiver_type)`: a specialization key. `Shape` pins a
/// specialization to one exact record shape (spec's "type-matched");
/// `Kind` pins it to every receiver of a [`ValueKind`], record or not
/// (spec's "kind-matched").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverType {
    Shape(u32),
    Kind(ValueKind),
}

/// What `impl(message, receiver)` found, in the priority order the send
/// protocol checks them: an exact-shape specialization beats a
/// kind-wide one, which beats the receiver simply having a field with
/// that name, which beats falling through to the hardcoded builtin
/// path, which can still fail to understand the message at all.
#[derive(Debug, Clone)]
pub enum Specialization {
    TypeMatched(Value),
    KindMatched(Value),
    PropertyMatched(Value),
    General,
    NoImplementation,
}

pub struct Engine {
    pub tables: Arc<InternTables>,
    pub shapes: Arc<ShapeRegistry>,
    pub gc: Arc<Collector>,
    pub config: EngineConfig,
    pub scheduler: Arc<Scheduler>,
    pub undefined_sigil_id: u32,
    pub false_sigil_id: u32,
    pub true_sigil_id: u32,
    pub ok_sigil_id: u32,
    pub err_sigil_id: u32,
    next_worker: AtomicU64,
    /// Live channels, keyed by the id carried in the `Value`'s
    /// [`ChannelData`]. `gab-core` keeps channel values as a bare id so
    /// the actual rendezvous slot (which needs a condvar, not just an
    /// `Arc`-shared struct) can live here instead.
    channels: RwLock<HashMap<u64, Arc<Channel>>>,
    fibers: RwLock<HashMap<u64, FiberHandle>>,
    next_channel_id: AtomicU64,
    /// Installed `def` specializations, consulted by `dispatch_cached`
    /// ahead of the hardcoded builtin fallback.
    specializations: RwLock<HashMap<(u32, ReceiverType), Value>>,
}

/// Owning handle to an [`Engine`]; `Clone` is cheap (an `Arc` bump) so
/// every fiber and worker thread can hold one.
#[derive(Clone)]
pub struct EngineHandle(Arc<Engine>);

impl std::ops::Deref for EngineHandle {
    type Target = Engine;
    fn deref(&self) -> &Engine {
        &self.0
    }
}

impl EngineHandle {
    /// The underlying `Arc<Engine>`, for callers (e.g.
    /// [`Engine::spawn_fiber`]) that need to hand the engine itself to
    /// a worker rather than just borrow it.
    pub fn inner(&self) -> Arc<Engine> {
        self.0.clone()
    }
}

impl Engine {
    #[instrument(skip(config))]
    pub fn create(config: EngineConfig) -> Result<EngineHandle, ConfigError> {
        config.validate()?;
        let tables = Arc::new(InternTables::new());
        // Well-known sigils, assigned once at startup in a fixed order
        // so `undefined` is always id 0 (matching `Value::undefined`'s
        // hardcoded sigil id) regardless of what else gets interned.
        let undefined_sigil_id = tables.intern_sigil("undefined");
        let false_sigil_id = tables.intern_sigil("false");
        let true_sigil_id = tables.intern_sigil("true");
        let ok_sigil_id = tables.intern_sigil("ok");
        let err_sigil_id = tables.intern_sigil("err");
        debug_assert_eq!(undefined_sigil_id, 0);

        let shapes = Arc::new(ShapeRegistry::new());
        let gc = Arc::new(Collector::new(config.worker_count, config.gc_buffer_max));
        let scheduler = Scheduler::new(config.worker_count);

        let engine = Arc::new(Engine {
            tables,
            shapes,
            gc,
            scheduler,
            undefined_sigil_id,
            false_sigil_id,
            true_sigil_id,
            ok_sigil_id,
            err_sigil_id,
            config,
            next_worker: AtomicU64::new(0),
            channels: RwLock::new(HashMap::new()),
            fibers: RwLock::new(HashMap::new()),
            next_channel_id: AtomicU64::new(1),
            specializations: RwLock::new(HashMap::new()),
        });
        info!(workers = engine.config.worker_count, "engine created");
        Ok(EngineHandle(engine))
    }

    /// Test-only constructor that skips `Scheduler::new`'s coroutine
    /// pool spin-up, for unit tests that only need dispatch/builtins
    /// wiring (e.g. `builtins::tests`).
    #[cfg(test)]
    pub fn new_for_test(config: EngineConfig) -> Engine {
        let tables = Arc::new(InternTables::new());
        let undefined_sigil_id = tables.intern_sigil("undefined");
        let false_sigil_id = tables.intern_sigil("false");
        let true_sigil_id = tables.intern_sigil("true");
        let ok_sigil_id = tables.intern_sigil("ok");
        let err_sigil_id = tables.intern_sigil("err");
        Engine {
            shapes: Arc::new(ShapeRegistry::new()),
            gc: Arc::new(Collector::new(1, config.gc_buffer_max)),
            scheduler: Scheduler::new_inline(),
            undefined_sigil_id,
            false_sigil_id,
            true_sigil_id,
            ok_sigil_id,
            err_sigil_id,
            tables,
            config,
            next_worker: AtomicU64::new(0),
            channels: RwLock::new(HashMap::new()),
            fibers: RwLock::new(HashMap::new()),
            next_channel_id: AtomicU64::new(1),
            specializations: RwLock::new(HashMap::new()),
        }
    }

    /// Shuts the worker pool down (closing the shared job queue and
    /// waiting for every worker to drain), then runs the collector four
    /// times. One pass per epoch would leave the epoch two generations
    /// behind "now" undrained; the three rotating epochs plus the final
    /// fold mean nothing outstanding is guaranteed walked until the
    /// fourth consecutive `collect()`. Finally drops the live channel
    /// and fiber registries — anything still parked on a `take` or
    /// `await` at this point was leaked by the host, not by `Engine`.
    #[instrument(skip(self))]
    pub fn destroy(self: Arc<Self>) {
        self.scheduler.shutdown();
        let mut freed = 0;
        for _ in 0..4 {
            freed += self.gc.collect();
        }
        self.channels.write().expect("channel table poisoned").clear();
        self.fibers.write().expect("fiber table poisoned").clear();
        debug!(freed, "engine destroyed");
    }

    pub fn bool_value(&self, b: bool) -> Value {
        Value::sigil(if b { self.true_sigil_id } else { self.false_sigil_id })
    }

    pub fn make_string(&self, s: &str) -> Value {
        if let Some(inline) = Value::inline_string(s) {
            inline
        } else {
            let (id, heap) = self.tables.strings.intern(s);
            Value::heap_string(heap, id)
        }
    }

    fn next_worker_id(&self) -> usize {
        (self.next_worker.fetch_add(1, Ordering::Relaxed) as usize) % self.config.worker_count.max(1)
    }

    /// Compiles and runs `src` as a fresh top-level unit on a VM borrowed
    /// from this call's own thread (not dispatched through the
    /// scheduler — see [`Engine::spawn_fiber`] for concurrent entry).
    pub fn eval(&self, src: &str) -> Result<Value, GabError> {
        let unit = gab_compiler::compile_source(src, self.tables.clone())?;
        let nested: Vec<Arc<gab_core::PrototypeData>> = unit.nested.into_iter().map(Arc::new).collect();
        let nested = Arc::new(nested);
        let block = Arc::new(BlockData {
            prototype: Arc::new(unit.prototype),
            upvalues: Vec::new(),
            nested,
        });
        let mut vm = Vm::new(self.next_worker_id());
        vm.run(self, block, vec![Value::undefined()])
    }

    /// Builds a record value from `fields` (message-keyed), deriving a
    /// fresh shape via [`ShapeRegistry::transition`] one key at a time
    /// from the root shape.
    pub fn build_record(&self, fields: &[(Value, Value)]) -> Value {
        let mut shape = self.shapes.root();
        let mut record = RecordData::empty(shape);
        for (key, value) in fields {
            let key_id = key.message_id().expect("record literal keys are always messages");
            shape = self.shapes.transition(shape, key_id);
            record = record.push(shape, value.clone());
        }
        let obj = Arc::new(HeapObject::Record(record));
        Value::record(obj)
    }

    /// Dissoc: returns a record equal to `receiver` with `key` removed,
    /// under a freshly transitioned shape that drops no other field's
    /// order. A key absent from `receiver`'s shape is a `Binding` error
    /// rather than a silent no-op — dissoc on a record is expected to
    /// name a field that's actually there.
    pub fn record_take(&self, receiver: &Value, key: &Value) -> Result<Value, GabError> {
        let Some(HeapObject::Record(record)) = receiver.heap_object() else {
            return Err(GabError::Type {
                status: GabStatus::NotRecord,
                found: receiver.kind(),
                expected: ValueKind::Record,
            });
        };
        let key_id = key.message_id().expect("dissoc keys are always messages");
        let shape = self.shapes.get(record.shape);
        let Some(index) = shape.index_of(key_id) else {
            return Err(GabError::runtime(GabStatus::ImplementationMissing, "dissoc on a key the record doesn't have"));
        };
        let new_shape = self.shapes.transition_without(record.shape, key_id);
        let taken = record.take_at(index, new_shape);
        Ok(Value::record(Arc::new(HeapObject::Record(taken))))
    }

    /// Cons: returns a record equal to `receiver` with `value` appended
    /// at the next positional key, under a freshly transitioned shape.
    /// The primitive `Op::Cons` and the bulk `Op::PackList`/
    /// `Op::PackRecord` (which call this once per packed element) both
    /// go through here, so a record built one append at a time and one
    /// built as a splat-pack end up under the same shapes.
    pub fn record_cons(&self, receiver: &Value, value: &Value) -> Result<Value, GabError> {
        let Some(HeapObject::Record(record)) = receiver.heap_object() else {
            return Err(GabError::Type {
                status: GabStatus::NotRecord,
                found: receiver.kind(),
                expected: ValueKind::Record,
            });
        };
        let key_id = self.tables.messages.intern(&record.len().to_string());
        let new_shape = self.shapes.transition(record.shape, key_id);
        let pushed = record.push(new_shape, value.clone());
        Ok(Value::record(Arc::new(HeapObject::Record(pushed))))
    }

    /// Builds the list-shaped value a splat target (`*v`) packs its
    /// middle region into — positionally keyed, same representation as
    /// [`Engine::build_tuple`].
    pub fn pack_list(&self, values: &[Value]) -> Value {
        self.build_tuple(values)
    }

    /// Builds the value a record-splat target (`**v`) packs its middle
    /// region into. Each packed value must itself be a 2-element
    /// `[key, value]` record (this runtime's tuple representation) —
    /// anything else is a `GabError::Type`, since there's no positional
    /// fallback for a key that was never named.
    pub fn pack_record(&self, values: &[Value]) -> Result<Value, GabError> {
        let mut fields = Vec::with_capacity(values.len());
        for pair in values {
            let Some(HeapObject::Record(pair_record)) = pair.heap_object() else {
                return Err(GabError::Type {
                    status: GabStatus::NotRecord,
                    found: pair.kind(),
                    expected: ValueKind::Record,
                });
            };
            if pair_record.len() != 2 {
                return Err(GabError::runtime(
                    GabStatus::ImplementationMissing,
                    "a record-splat's packed values must be [key, value] pairs",
                ));
            }
            let key = pair_record.get_at(0).expect("len checked above");
            let value = pair_record.get_at(1).expect("len checked above");
            fields.push((key, value));
        }
        Ok(self.build_record(&fields))
    }

    /// `make: channel` — allocates a fresh single-slot rendezvous
    /// channel and returns a `Channel`-kind value identifying it.
    pub fn make_channel(&self) -> Value {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        self.channels.write().expect("channel table poisoned").insert(id, Arc::new(Channel::new()));
        Value::channel(Arc::new(HeapObject::Channel(ChannelData { id })))
    }

    fn channel_for(&self, id: u64) -> Option<Arc<Channel>> {
        self.channels.read().expect("channel table poisoned").get(&id).cloned()
    }

    /// `make: fiber` — hands `block`/`args` to the scheduler's worker
    /// pool and registers the resulting join handle so a later `await`
    /// send can find it by id.
    pub fn spawn_fiber(self: &Arc<Self>, block: Arc<BlockData>, args: Vec<Value>) -> Value {
        let handle = self.scheduler.clone().spawn_fiber(self.clone(), block, args);
        let id = handle.id;
        self.fibers.write().expect("fiber table poisoned").insert(id, handle);
        Value::fiber(Arc::new(HeapObject::Fiber(FiberData { id })))
    }

    fn await_fiber(&self, id: u64) -> Result<Value, GabError> {
        let handle = self
            .fibers
            .read()
            .expect("fiber table poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| GabError::runtime(GabStatus::ImplementationMissing, "await on an unknown fiber"))?;
        handle.join()
    }

    /// Wraps a successful VM completion as `[ok, value]` (spec §4.7's
    /// result-slice convention).
    pub fn ok_result(&self, value: Value) -> Value {
        self.build_tuple(&[Value::sigil(self.ok_sigil_id), value])
    }

    /// Wraps a failed VM completion as `[err, detail]`, where `detail`
    /// is `err`'s own `{status, message}` record.
    pub fn err_result(&self, err: &GabError) -> Value {
        let detail = err.to_record(&self.tables, &self.shapes);
        self.build_tuple(&[Value::sigil(self.err_sigil_id), detail])
    }

    /// Builds a tuple as a record under positional keys `"0"`, `"1"`,
    /// ... so tuples and records share one representation end to end
    /// (spec's tuple/record unification).
    pub fn build_tuple(&self, items: &[Value]) -> Value {
        let fields: Vec<(Value, Value)> = items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let id = self.tables.messages.intern(&i.to_string());
                (Value::message(id), v.clone())
            })
            .collect();
        self.build_record(&fields)
    }

    /// `def(message, receiver_type, specialization)` — installs a new
    /// specialization. Rejects a second `def` for the same
    /// `(message, receiver_type)` pair with `ImplementationExists`
    /// rather than silently overwriting it: a redefinition has to go
    /// through a host-level "undef" this engine doesn't offer, matching
    /// the property the send-cache-coherence tests rely on (once a site
    /// specializes, it can't be quietly swapped out from under it).
    pub fn def(&self, message: &Value, receiver_type: ReceiverType, specialization: Value) -> Result<(), GabError> {
        let message_id = message.message_id().expect("def messages are always messages");
        let mut table = self.specializations.write().expect("specialization table poisoned");
        if table.contains_key(&(message_id, receiver_type)) {
            return Err(GabError::runtime(
                GabStatus::ImplementationExists,
                "message already has a specialization for this receiver type",
            ));
        }
        table.insert((message_id, receiver_type), specialization);
        Ok(())
    }

    /// `impl(message, receiver)` — the send protocol's resolution step
    /// (spec §4.5), checked in priority order: a specialization pinned
    /// to the receiver's exact shape, one pinned to its whole kind, the
    /// receiver simply having a field named `message` (records only),
    /// then the hardcoded fallback.
    pub fn r#impl(&self, message: &Value, receiver: &Value) -> Specialization {
        let Some(message_id) = message.message_id() else {
            return Specialization::NoImplementation;
        };
        let table = self.specializations.read().expect("specialization table poisoned");

        if let ValueKind::Record = receiver.kind() {
            if let Some(HeapObject::Record(record)) = receiver.heap_object() {
                if let Some(target) = table.get(&(message_id, ReceiverType::Shape(record.shape))) {
                    return Specialization::TypeMatched(target.clone());
                }
                let shape = self.shapes.get(record.shape);
                if let Some(index) = shape.index_of(message_id) {
                    let value = record.get_at(index).expect("shape index always in bounds");
                    return Specialization::PropertyMatched(value);
                }
            }
        }

        if let Some(target) = table.get(&(message_id, ReceiverType::Kind(receiver.kind()))) {
            return Specialization::KindMatched(target.clone());
        }

        Specialization::General
    }

    /// Resolves `message` sent to `receiver`, probing `cache` first and
    /// consulting [`Engine::r#impl`] on a miss before falling back to
    /// [`Engine::dispatch_builtin`]. Builtin numeric/string/sigil
    /// operations are never cached as a resolved target (they're
    /// already as fast as a cache hit would be) but still tag the
    /// cache's key so a later receiver of a different kind at the same
    /// site is recognized as a miss — a textbook polymorphic-site
    /// scenario.
    pub fn dispatch_cached(
        &self,
        vm: &mut Vm,
        cache: &SendCacheSlot,
        receiver: &Value,
        message: &Value,
        args: &[Value],
        flags: SendFlags,
    ) -> Result<Value, GabError> {
        let message_id = message.message_id().expect("send sites always carry a message constant");
        let message_name = self.tables.messages.name(message_id).unwrap_or_default();
        let max_len = self.config.send_cache_len;
        let _ = flags;

        if let ValueKind::Record = receiver.kind() {
            let Some(HeapObject::Record(record)) = receiver.heap_object() else {
                unreachable!("Record-kind value without a Record heap object");
            };
            if let Some(cached) = cache.probe(record.shape, max_len) {
                return self.invoke_property(vm, cached, args);
            }
            return match self.r#impl(message, receiver) {
                Specialization::TypeMatched(target) | Specialization::KindMatched(target) | Specialization::PropertyMatched(target) => {
                    cache.fill(record.shape, Some(target.clone()), max_len);
                    self.invoke_property(vm, target, args)
                }
                Specialization::General | Specialization::NoImplementation => {
                    cache.fill(record.shape, None, max_len);
                    Err(GabError::Dispatch {
                        receiver_kind: ValueKind::Record,
                        message: message_name,
                    })
                }
            };
        }

        let key = match receiver.kind() {
            ValueKind::Number => NUMBER_CACHE_KEY,
            ValueKind::String => STRING_CACHE_KEY,
            ValueKind::Sigil => SIGIL_CACHE_KEY,
            ValueKind::Channel => CHANNEL_CACHE_KEY,
            ValueKind::Fiber => FIBER_CACHE_KEY,
            other => {
                return Err(GabError::Dispatch {
                    receiver_kind: other,
                    message: message_name,
                })
            }
        };
        if let Specialization::KindMatched(target) = self.r#impl(message, receiver) {
            cache.fill(key, Some(target.clone()), max_len);
            return self.invoke_property(vm, target, args);
        }
        cache.fill(key, None, max_len);
        self.dispatch_builtin(receiver, &message_name, args)
    }

    fn invoke_property(&self, vm: &mut Vm, value: Value, args: &[Value]) -> Result<Value, GabError> {
        if let Some(HeapObject::Block(block)) = value.heap_object() {
            return vm.call_block(self, Arc::new(block.clone()), args.to_vec());
        }
        if args.len() == 1 {
            return Ok(value);
        }
        Err(GabError::runtime(GabStatus::NotCallable, "property is not callable with arguments"))
    }

    fn dispatch_builtin(&self, receiver: &Value, message_name: &str, args: &[Value]) -> Result<Value, GabError> {
        match receiver.kind() {
            ValueKind::Number => {
                let n = receiver.as_f64().expect("Number-kind value always decodes");
                builtins::number_send(self, n, message_name, args).unwrap_or_else(|| {
                    Err(GabError::Dispatch {
                        receiver_kind: ValueKind::Number,
                        message: message_name.to_string(),
                    })
                })
            }
            ValueKind::Sigil => match message_name {
                "==" => Ok(self.bool_value(args.first().map(|a| a.sigil_id() == receiver.sigil_id()).unwrap_or(false))),
                "!=" => Ok(self.bool_value(args.first().map(|a| a.sigil_id() != receiver.sigil_id()).unwrap_or(true))),
                _ => Err(GabError::Dispatch {
                    receiver_kind: ValueKind::Sigil,
                    message: message_name.to_string(),
                }),
            },
            ValueKind::String => match message_name {
                "==" => Ok(self.bool_value(args.first() == Some(receiver))),
                _ => Err(GabError::Dispatch {
                    receiver_kind: ValueKind::String,
                    message: message_name.to_string(),
                }),
            },
            ValueKind::Channel => {
                let id = receiver.channel_id().expect("Channel-kind value always carries an id");
                let chan = self.channel_for(id).ok_or_else(|| {
                    GabError::runtime(GabStatus::ImplementationMissing, "channel no longer registered")
                })?;
                match message_name {
                    "put" => {
                        let value = args.first().cloned().unwrap_or_else(Value::undefined);
                        Ok(self.bool_value(chan.put(value).is_ok()))
                    }
                    "take" => Ok(chan.take()),
                    "close" => {
                        chan.close();
                        Ok(receiver.clone())
                    }
                    _ => Err(GabError::Dispatch {
                        receiver_kind: ValueKind::Channel,
                        message: message_name.to_string(),
                    }),
                }
            }
            ValueKind::Fiber => {
                let id = receiver.fiber_id().expect("Fiber-kind value always carries an id");
                match message_name {
                    "await" => self.await_fiber(id),
                    _ => Err(GabError::Dispatch {
                        receiver_kind: ValueKind::Fiber,
                        message: message_name.to_string(),
                    }),
                }
            }
            other => Err(GabError::Dispatch {
                receiver_kind: other,
                message: message_name.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_sigils_have_stable_ids() {
        let eng = Engine::create(EngineConfig::default()).unwrap();
        assert_eq!(eng.undefined_sigil_id, 0);
        assert_ne!(eng.true_sigil_id, eng.false_sigil_id);
    }

    #[test]
    fn destroy_shuts_the_scheduler_down_and_clears_registries() {
        let eng = Engine::create(EngineConfig::default()).unwrap();
        let chan = eng.make_channel();
        assert_eq!(chan.kind(), ValueKind::Channel);
        let inner = eng.inner();
        inner.destroy();
    }

    #[test]
    fn build_record_round_trips_a_field() {
        let eng = Engine::create(EngineConfig::default()).unwrap();
        let key = Value::message(eng.tables.messages.intern("x"));
        let record = eng.build_record(&[(key, Value::from_f64(5.0))]);
        assert_eq!(record.kind(), ValueKind::Record);
    }

    #[test]
    fn def_then_impl_resolves_a_kind_matched_specialization() {
        let eng = Engine::new_for_test(EngineConfig::default());
        let message = Value::message(eng.tables.messages.intern("greet"));
        eng.def(&message, ReceiverType::Kind(ValueKind::Number), Value::from_f64(1.0)).unwrap();
        match eng.r#impl(&message, &Value::from_f64(5.0)) {
            Specialization::KindMatched(v) => assert_eq!(v.as_f64(), Some(1.0)),
            other => panic!("expected a kind-matched specialization, got {other:?}"),
        }
    }

    #[test]
    fn def_rejects_a_duplicate_specialization() {
        let eng = Engine::new_for_test(EngineConfig::default());
        let message = Value::message(eng.tables.messages.intern("greet"));
        eng.def(&message, ReceiverType::Kind(ValueKind::Number), Value::from_f64(1.0)).unwrap();
        assert!(eng.def(&message, ReceiverType::Kind(ValueKind::Number), Value::from_f64(2.0)).is_err());
    }

    #[test]
    fn a_shape_specialization_takes_priority_over_a_same_named_property() {
        let eng = Engine::new_for_test(EngineConfig::default());
        let key = Value::message(eng.tables.messages.intern("x"));
        let record = eng.build_record(&[(key.clone(), Value::from_f64(1.0))]);
        let Some(HeapObject::Record(r)) = record.heap_object() else {
            unreachable!();
        };
        eng.def(&key, ReceiverType::Shape(r.shape), Value::from_f64(99.0)).unwrap();
        match eng.r#impl(&key, &record) {
            Specialization::TypeMatched(v) => assert_eq!(v.as_f64(), Some(99.0)),
            other => panic!("expected a type-matched specialization, got {other:?}"),
        }
    }

    #[test]
    fn record_take_drops_the_key_and_keeps_the_rest() {
        let eng = Engine::new_for_test(EngineConfig::default());
        let x = Value::message(eng.tables.messages.intern("x"));
        let y = Value::message(eng.tables.messages.intern("y"));
        let record = eng.build_record(&[(x.clone(), Value::from_f64(1.0)), (y.clone(), Value::from_f64(2.0))]);
        let taken = eng.record_take(&record, &x).unwrap();
        let Some(HeapObject::Record(r)) = taken.heap_object() else {
            panic!("record_take must return a record");
        };
        assert_eq!(r.get_at(0).unwrap().as_f64(), Some(2.0));
        assert_eq!(r.get_at(1), None);
    }

    #[test]
    fn record_take_on_a_missing_key_is_an_error() {
        let eng = Engine::new_for_test(EngineConfig::default());
        let x = Value::message(eng.tables.messages.intern("x"));
        let missing = Value::message(eng.tables.messages.intern("missing"));
        let record = eng.build_record(&[(x, Value::from_f64(1.0))]);
        assert!(eng.record_take(&record, &missing).is_err());
    }

    #[test]
    fn channel_put_then_take_round_trips_through_dispatch() {
        let eng = Engine::new_for_test(EngineConfig::default());
        let chan = eng.make_channel();
        let put = eng.dispatch_builtin(&chan, "put", &[Value::from_f64(9.0)]).unwrap();
        assert_eq!(put.kind(), ValueKind::Sigil);
        let taken = eng.dispatch_builtin(&chan, "take", &[]).unwrap();
        assert_eq!(taken.as_f64(), Some(9.0));
    }

    #[test]
    fn fiber_spawned_inline_awaits_to_its_result() {
        let eng = Arc::new(Engine::new_for_test(EngineConfig::default()));
        let mut chunk = gab_compiler::opcode::Chunk::new();
        chunk.push_return(1, SendFlags::default(), 0);
        let block = Arc::new(BlockData {
            prototype: Arc::new(gab_core::value::PrototypeData {
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
        let fiber = eng.spawn_fiber(block, vec![Value::from_f64(3.0)]);
        let result = eng.dispatch_builtin(&fiber, "await", &[]).unwrap();
        let Some(HeapObject::Record(r)) = result.heap_object() else {
            panic!("await result must be a [ok, value] tuple");
        };
        assert_eq!(r.get_at(0).unwrap().sigil_id(), Some(eng.ok_sigil_id));
        assert_eq!(r.get_at(1).unwrap().as_f64(), Some(3.0));
    }
}
