//! The stack-based bytecode dispatch loop (spec §4.5).
//!
//! One [`Vm`] per fiber: a contiguous value stack, a frame stack, and a
//! single dispatch loop that decodes and executes opcodes from the
//! active frame's prototype. Every `Send` site carries four inline
//! cache slots immediately after its operands; a cache hit skips the
//! generic message-lookup path entirely and jumps straight to the
//! cached implementation, the same in-place specialization strategy the
//! reference engine's `gab_vm_frame`/send-cache design uses.

use std::sync::Arc;

use gab_compiler::limits;
use gab_compiler::opcode::{Op, SendFlags};
use gab_core::value::{BlockData, HeapObject, PrototypeData};
use gab_core::{GabError, GabStatus, Value};
use tracing::trace;

use crate::engine::Engine;

/// One activation record. `want` is how many return values the caller
/// expects; `Trim` at return time reconciles the callee's actual return
/// count against it (spec's "Trim nodes").
struct Frame {
    block: Arc<BlockData>,
    ip: usize,
    slots_base: usize,
    want: u8,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    worker_id: usize,
}

impl Vm {
    pub fn new(worker_id: usize) -> Self {
        Vm {
            stack: Vec::with_capacity(limits::GAB_STACK_MAX),
            frames: Vec::new(),
            worker_id,
        }
    }

    /// Pushes `value` onto the stack. Every push is either a freshly
    /// allocated object's first reference or a duplicate of a reference
    /// that already lives somewhere else (a local, an upvalue, a
    /// constant); either way the stack slot is a new outstanding
    /// reference, so this both snapshots the root (for a collection
    /// pass that runs mid-fiber) and increments the mutator refcount
    /// (spec §4.6's `iref`).
    fn push(&mut self, engine: &Engine, value: Value) {
        engine.gc.record_root(self.worker_id, value.clone());
        engine.gc.record_increment(self.worker_id, value.clone());
        self.stack.push(value);
    }

    /// Pops the top of the stack, decrementing its mutator refcount
    /// (spec §4.6's `dref`) — the stack slot that held it no longer
    /// counts as a reference. Callers that move the value into a new
    /// durable home (a local slot, a block's upvalues, a record's trie)
    /// re-increment it there.
    fn pop(&mut self, engine: &Engine) -> Value {
        let value = self.stack.pop().expect("vm stack underflow");
        engine.gc.record_decrement(self.worker_id, value.clone());
        value
    }

    /// Truncates the stack to `new_len`, decrementing every value that
    /// falls off the end. Used wherever a frame drops a whole range of
    /// slots at once (return, over-trim, a send's consumed receiver and
    /// arguments) instead of popping one at a time.
    fn truncate(&mut self, engine: &Engine, new_len: usize) {
        for value in self.stack.drain(new_len..) {
            engine.gc.record_decrement(self.worker_id, value);
        }
    }

    /// Runs `block` with `args` (the first argument conventionally being
    /// the receiver, slot 0). A normal completion or an in-language
    /// failure (a bad send, a type error, ...) both return `Ok` — the
    /// result slice is always `[ok, value]` or `[err, detail]` (spec
    /// §4.7), since the VM itself never unwinds on those. `Err` here is
    /// reserved for host-level faults a fiber can't recover a value
    /// from: stack overflow or malformed bytecode.
    pub fn run(&mut self, engine: &Engine, block: Arc<BlockData>, args: Vec<Value>) -> Result<Value, GabError> {
        let proto = block.prototype.clone();
        let slots_base = self.stack.len();
        for arg in args {
            self.push(engine, arg);
        }
        while self.stack.len() < slots_base + proto.nslots as usize {
            self.push(engine, Value::undefined());
        }
        self.frames.push(Frame {
            block,
            ip: 0,
            slots_base,
            want: 1,
        });

        loop {
            if self.frames.len() > limits::GAB_FRAMES_MAX {
                return Err(GabError::runtime(GabStatus::Overflow, "call stack exceeded GAB_FRAMES_MAX"));
            }
            match self.step(engine) {
                Ok(Some(result)) => return Ok(engine.ok_result(result)),
                Ok(None) => continue,
                Err(err) if Self::is_host_fault(&err) => return Err(err),
                Err(err) => return Ok(engine.err_result(&err)),
            }
        }
    }

    /// Host-level faults abort the fiber outright rather than becoming
    /// an in-language `err` value — there's no sane record to hand back
    /// for "the VM's own bytecode is corrupt" or "the call stack is
    /// unrecoverably deep".
    fn is_host_fault(err: &GabError) -> bool {
        matches!(err.status(), GabStatus::Overflow | GabStatus::Panic)
    }

    fn current_proto(&self) -> &Arc<PrototypeData> {
        &self.frames.last().expect("no active frame").block.prototype
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.block.prototype.bytecode[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        u16::from_be_bytes([hi, lo])
    }

    fn slots_base(&self) -> usize {
        self.frames.last().expect("no active frame").slots_base
    }

    /// Splits the scratch region above `base` into `below` untouched
    /// fixed targets (left on the stack), the `above` fixed targets on
    /// top (popped off and handed back so the caller can re-push them
    /// once the packed value is in place), and everything in between —
    /// the run `Op::PackList`/`Op::PackRecord` absorb for a splat
    /// target. Relies on the same invariant `Op::Trim` does: the
    /// compiler never leaves anything but this frame's own values in
    /// this region between statements.
    fn split_pack_region(&mut self, engine: &Engine, base: usize, below: usize, above: usize) -> (Vec<Value>, Vec<Value>) {
        let total = self.stack.len() - base;
        let middle_len = total - below - above;

        let mut above_values = Vec::with_capacity(above);
        for _ in 0..above {
            above_values.push(self.pop(engine));
        }
        above_values.reverse();

        let mut middle = Vec::with_capacity(middle_len);
        for _ in 0..middle_len {
            let value = self.pop(engine);
            engine.gc.record_increment(self.worker_id, value.clone());
            middle.push(value);
        }
        middle.reverse();

        (middle, above_values)
    }

    /// Executes exactly one instruction. Returns `Some(value)` when the
    /// top-level frame has returned (the fiber is finished), `None` to
    /// keep looping.
    fn step(&mut self, engine: &Engine) -> Result<Option<Value>, GabError> {
        let op_byte = self.read_u8();
        let op = Op::from_byte(op_byte)
            .ok_or_else(|| GabError::runtime(GabStatus::Panic, format!("malformed opcode byte {op_byte}")))?;
        trace!(?op, worker = self.worker_id, "dispatch");

        match op {
            Op::PushConstant => {
                let idx = self.read_u16();
                let value = self.current_proto().constants[idx as usize].clone();
                self.push(engine, value);
            }
            Op::PushLocal => {
                let slot = self.read_u8() as usize;
                let base = self.slots_base();
                let value = self.stack[base + slot].clone();
                self.push(engine, value);
            }
            Op::StoreLocal => {
                let slot = self.read_u8() as usize;
                let base = self.slots_base();
                let value = self.pop(engine);
                engine.gc.record_root(self.worker_id, value.clone());
                engine.gc.record_increment(self.worker_id, value.clone());
                let old = std::mem::replace(&mut self.stack[base + slot], value);
                engine.gc.record_decrement(self.worker_id, old);
            }
            Op::PushUpvalue => {
                let slot = self.read_u8() as usize;
                let frame = self.frames.last().expect("no active frame");
                let value = frame.block.upvalues[slot].clone();
                self.push(engine, value);
            }
            Op::StoreUpvalue => {
                // Upvalues captured from immutable locals are never
                // reassigned post-capture (spec: "reassigning a captured
                // variable is rejected" at compile time); this opcode
                // exists for completeness of the instruction set but the
                // compiler never emits it.
                return Err(GabError::runtime(GabStatus::CapturedMutable, "upvalues are immutable"));
            }
            Op::Pop => {
                self.pop(engine);
            }
            Op::Send => self.dispatch_send(engine)?,
            Op::MakeBlock => {
                let proto_idx = self.read_u16() as usize;
                let nested = self.frames.last().expect("no active frame").block.nested.clone();
                let proto = nested[proto_idx].clone();
                let nupvalues = proto.nupvalues as usize;
                let mut upvalues = vec![Value::undefined(); nupvalues];
                for slot in (0..nupvalues).rev() {
                    let value = self.pop(engine);
                    engine.gc.record_increment(self.worker_id, value.clone());
                    upvalues[slot] = value;
                }
                let block = Arc::new(HeapObject::Block(BlockData {
                    prototype: proto,
                    upvalues,
                    nested,
                }));
                self.push(engine, Value::block(block));
            }
            Op::MakeTuple => {
                let n = self.read_u8() as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    let value = self.pop(engine);
                    engine.gc.record_increment(self.worker_id, value.clone());
                    items.push(value);
                }
                items.reverse();
                // A tuple is represented as a record under the
                // positional "tuple of n" shape, keeping one value
                // representation for both.
                let record = engine.build_tuple(&items);
                self.push(engine, record);
            }
            Op::MakeRecord => {
                let nfields = self.read_u8() as usize;
                let mut fields = Vec::with_capacity(nfields);
                for _ in 0..nfields {
                    let value = self.pop(engine);
                    let key = self.pop(engine);
                    engine.gc.record_increment(self.worker_id, value.clone());
                    engine.gc.record_increment(self.worker_id, key.clone());
                    fields.push((key, value));
                }
                fields.reverse();
                let record = engine.build_record(&fields);
                self.push(engine, record);
            }
            Op::Jump => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip += offset;
            }
            Op::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                let cond = self.pop(engine);
                if !cond.is_truthy(engine.false_sigil_id) {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip -= offset;
            }
            Op::Trim => {
                let want = self.read_u8();
                let base = self.slots_base();
                let have = self.stack.len() - base;
                match (want as usize).cmp(&have) {
                    std::cmp::Ordering::Less => self.truncate(engine, base + want as usize),
                    std::cmp::Ordering::Greater => {
                        while self.stack.len() < base + want as usize {
                            self.push(engine, Value::undefined());
                        }
                    }
                    std::cmp::Ordering::Equal => {}
                }
            }
            Op::PackList => {
                let below = self.read_u8() as usize;
                let above = self.read_u8() as usize;
                let base = self.slots_base();
                let (middle, above_values) = self.split_pack_region(engine, base, below, above);
                let packed = engine.pack_list(&middle);
                self.push(engine, packed);
                for value in above_values {
                    self.push(engine, value);
                }
            }
            Op::PackRecord => {
                let below = self.read_u8() as usize;
                let above = self.read_u8() as usize;
                let base = self.slots_base();
                let (middle, above_values) = self.split_pack_region(engine, base, below, above);
                let packed = engine.pack_record(&middle)?;
                self.push(engine, packed);
                for value in above_values {
                    self.push(engine, value);
                }
            }
            Op::Cons => {
                let value = self.pop(engine);
                let receiver = self.pop(engine);
                let consed = engine.record_cons(&receiver, &value)?;
                self.push(engine, consed);
            }
            Op::Return => {
                let want = self.read_u8();
                let _flags = SendFlags(self.read_u8());
                let result = if want == 0 { Value::undefined() } else { self.pop(engine) };
                let frame = self.frames.pop().expect("return with no active frame");
                self.truncate(engine, frame.slots_base);
                if self.frames.is_empty() {
                    return Ok(Some(result));
                }
                self.push(engine, result);
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Generic message dispatch: probe this send site's inline cache
    /// first, and only fall back to resolving `message` against the
    /// receiver's shape/kind on a miss. A failing lookup produces a
    /// `GabError::Dispatch` rather than unwinding (spec §7's
    /// failure-as-value model governs how the embedder turns that into
    /// an `err` record); dispatch failures never abort the fiber
    /// outright at this layer.
    fn dispatch_send(&mut self, engine: &Engine) -> Result<(), GabError> {
        let message_idx = self.read_u16();
        let nargs = self.read_u8() as usize;
        let flags = SendFlags(self.read_u8());
        let site = self.read_u16() as usize;
        for _ in 2..gab_compiler::compiler::CACHE_LINE_BYTES {
            self.read_u8();
        }

        let message = self.current_proto().constants[message_idx as usize].clone();
        let args_start = self.stack.len() - nargs;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        let receiver = args[0].clone();
        self.truncate(engine, args_start - 1); // also drop the receiver

        let proto = self.current_proto().clone();
        let cache = &proto.send_cache[site];
        let result = engine.dispatch_cached(self, cache, &receiver, &message, &args[..], flags)?;
        self.push(engine, result);
        Ok(())
    }

    /// Entry point used by `Engine::dispatch` to invoke a user-defined
    /// block found during message resolution: runs it as a nested call
    /// on this same VM's stack (not a new fiber), matching ordinary
    /// (non-tail) Gab calls.
    pub fn call_block(&mut self, engine: &Engine, block: Arc<BlockData>, args: Vec<Value>) -> Result<Value, GabError> {
        self.run(engine, block, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineHandle};
    use crate::config::EngineConfig;

    fn engine() -> EngineHandle {
        Engine::create(EngineConfig::default()).expect("engine create")
    }

    /// Unwraps a `[ok, value]`/`[err, detail]` result slice, asserting
    /// it's the `ok` half and returning the value.
    fn expect_ok(eng: &EngineHandle, result: Value) -> Value {
        assert_eq!(result.kind(), gab_core::ValueKind::Record, "result must be a [sigil, value] tuple");
        let sigil = result.heap_object().and_then(|h| {
            if let gab_core::HeapObject::Record(r) = h {
                r.get_at(0)
            } else {
                None
            }
        });
        assert_eq!(sigil.and_then(|v| v.sigil_id()), Some(eng.ok_sigil_id), "expected an ok result");
        let Some(gab_core::HeapObject::Record(r)) = result.heap_object() else {
            unreachable!();
        };
        r.get_at(1).expect("ok tuple always has a value slot")
    }

    #[test]
    fn evaluates_a_number_literal() {
        let eng = engine();
        let result = eng.eval("42").unwrap();
        let value = expect_ok(&eng, result);
        assert_eq!(value.as_f64(), Some(42.0));
    }

    #[test]
    fn evaluates_arithmetic() {
        let eng = engine();
        let result = eng.eval("1 + 2").unwrap();
        let value = expect_ok(&eng, result);
        assert_eq!(value.as_f64(), Some(3.0));
    }

    #[test]
    fn evaluates_a_local_assignment_and_use() {
        let eng = engine();
        let result = eng.eval("x = 10\nx + 1").unwrap();
        let value = expect_ok(&eng, result);
        assert_eq!(value.as_f64(), Some(11.0));
    }

    #[test]
    fn evaluates_a_tuple() {
        let eng = engine();
        let result = eng.eval("(1, 2, 3)").unwrap();
        let value = expect_ok(&eng, result);
        assert_eq!(value.kind(), gab_core::ValueKind::Record);
    }

    #[test]
    fn evaluating_a_record_literal_registers_it_with_the_collector() {
        let eng = engine();
        // Before this wiring, only `record_root` ever fired and
        // `record_increment` was dead code outside gc.rs's own tests —
        // a freshly built record's refcount was never actually folded
        // into the live table at all. It is now.
        let result = eng.eval("[x: 5]").unwrap();
        let value = expect_ok(&eng, result);
        for _ in 0..3 {
            eng.gc.collect();
        }
        assert!(eng.gc.live_count(&value).is_some());
    }

    #[test]
    fn evaluates_a_multi_target_assignment() {
        let eng = engine();
        let result = eng.eval("a, b = 1, 2\nb").unwrap();
        let value = expect_ok(&eng, result);
        assert_eq!(value.as_f64(), Some(2.0));
    }

    #[test]
    fn a_list_splat_target_absorbs_the_unclaimed_middle() {
        let eng = engine();
        let result = eng.eval("a, *rest = 1, 2, 3\nrest").unwrap();
        let value = expect_ok(&eng, result);
        let Some(gab_core::HeapObject::Record(r)) = value.heap_object() else {
            panic!("rest should be a record");
        };
        assert_eq!(r.len(), 2);
        assert_eq!(r.get_at(0).unwrap().as_f64(), Some(2.0));
        assert_eq!(r.get_at(1).unwrap().as_f64(), Some(3.0));
    }

    #[test]
    fn a_short_rhs_pads_before_a_splat_so_it_packs_empty() {
        let eng = engine();
        let result = eng.eval("a, *rest = 1\nrest").unwrap();
        let value = expect_ok(&eng, result);
        let Some(gab_core::HeapObject::Record(r)) = value.heap_object() else {
            panic!("rest should be a record");
        };
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn a_record_splat_target_packs_key_value_pairs() {
        let eng = engine();
        let result = eng.eval("**rest = (\"x\", 1), (\"y\", 2)\nrest").unwrap();
        let value = expect_ok(&eng, result);
        let Some(gab_core::HeapObject::Record(r)) = value.heap_object() else {
            panic!("rest should be a record");
        };
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn a_failing_send_yields_an_err_result_instead_of_unwinding() {
        let eng = engine();
        let result = eng.eval("5 frobnicate").unwrap();
        assert_eq!(result.kind(), gab_core::ValueKind::Record);
        let Some(gab_core::HeapObject::Record(r)) = result.heap_object() else {
            unreachable!();
        };
        let sigil = r.get_at(0).unwrap();
        assert_eq!(sigil.sigil_id(), Some(eng.err_sigil_id));
    }
}
