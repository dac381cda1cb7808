//! AST → bytecode prototype compiler.
//!
//! Implements closure conversion (upvalue capture/resolution across
//! lexical scopes, spec §4.4), tail-call detection (the `HAVE_TAIL` bit
//! on the trailing send of a block body), and reserves the inline-cache
//! bytes every send site carries so the VM can specialize in place
//! without ever relocating bytecode.

use std::sync::Arc;

use gab_core::value::PrototypeData;
use gab_core::{GabError, GabStatus, InternTables, TokenRef, Value};

use crate::ast::{AssignTarget, BlockLiteral, Expr, Literal, Program, SplatKind};
use crate::opcode::{Chunk, SendFlags};

/// Four cache slots of two bytes each: a cached shape/type id per slot,
/// matching `cGAB_SEND_CACHE_LEN = 4` and `GAB_SEND_HASH`'s masking by
/// that length. Reserved inline after every `Send` instruction.
pub const CACHE_LINE_BYTES: usize = 8;

struct Local {
    name: String,
    depth: u32,
    initialized: bool,
    captured: bool,
    mutable: bool,
}

struct Upvalue {
    name: String,
    is_local: bool,
    index: u8,
}

struct FnScope {
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    depth: u32,
    chunk: Chunk,
    constants: Vec<Value>,
    name: Value,
    send_sites: u16,
}

impl FnScope {
    fn new(name: Value) -> Self {
        FnScope {
            locals: Vec::new(),
            upvalues: Vec::new(),
            depth: 0,
            chunk: Chunk::new(),
            constants: Vec::new(),
            name,
            send_sites: 0,
        }
    }

    /// Allocates the next send-site ordinal for this scope's prototype.
    fn next_send_site(&mut self) -> u16 {
        let site = self.send_sites;
        self.send_sites += 1;
        site
    }

    fn add_constant(&mut self, value: Value) -> Result<u16, GabError> {
        for (i, existing) in self.constants.iter().enumerate() {
            if existing == &value {
                return Ok(i as u16);
            }
        }
        if self.constants.len() >= u16::MAX as usize {
            return Err(GabError::runtime(GabStatus::Overflow, "too many constants in one prototype"));
        }
        self.constants.push(value);
        Ok(self.constants.len() as u16 - 1)
    }
}

/// The result of compiling one source unit: the entry-point prototype
/// plus every nested block prototype it (transitively) creates via
/// `MakeBlock`, indexed the same way the bytecode's `MakeBlock` operand
/// addresses them.
pub struct CompiledUnit {
    pub prototype: PrototypeData,
    pub nested: Vec<PrototypeData>,
}

pub struct Compiler {
    tables: Arc<InternTables>,
    scopes: Vec<FnScope>,
    prototypes_out: Vec<PrototypeData>,
}

impl Compiler {
    pub fn new(tables: Arc<InternTables>) -> Self {
        Compiler {
            tables,
            scopes: Vec::new(),
            prototypes_out: Vec::new(),
        }
    }

    pub fn compile_program(mut self, program: &Program) -> Result<CompiledUnit, GabError> {
        self.scopes.push(FnScope::new(Value::undefined()));
        // Slot 0 is always the implicit receiver ("self") of a block.
        self.declare_local("self", false)?;
        self.initialize_last_local();

        self.compile_body(&program.body)?;
        let prototype = self.finish_current_scope(1)?;
        Ok(CompiledUnit {
            prototype,
            nested: self.prototypes_out,
        })
    }

    fn compile_body(&mut self, body: &[Expr]) -> Result<(), GabError> {
        for (i, expr) in body.iter().enumerate() {
            let is_last = i + 1 == body.len();
            self.compile_expr(expr, is_last)?;
            if !is_last {
                let tok = self.token_u32(expr);
                self.chunk_mut().pop(tok);
            }
        }
        if body.is_empty() {
            self.emit_undefined(TokenRef::default());
        }
        Ok(())
    }

    fn finish_current_scope(&mut self, narguments: u8) -> Result<PrototypeData, GabError> {
        let scope = self.scopes.pop().expect("scope stack underflow");
        let mut chunk = scope.chunk;
        chunk.push_return(1, SendFlags::default(), 0);
        let upvalue_is_local = scope.upvalues.iter().map(|u| u.is_local).collect();
        let upvalue_index = scope.upvalues.iter().map(|u| u.index).collect();
        let send_cache = (0..scope.send_sites).map(|_| gab_core::SendCacheSlot::new()).collect();
        Ok(PrototypeData {
            name: scope.name,
            narguments,
            nslots: scope.locals.len() as u8,
            nupvalues: scope.upvalues.len() as u8,
            bytecode: chunk.bytecode,
            tokens: chunk.tokens,
            constants: scope.constants,
            upvalue_is_local,
            upvalue_index,
            send_cache,
        })
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.scopes.last_mut().expect("no active scope").chunk
    }

    fn token_ref(&self, expr: &Expr) -> TokenRef {
        let loc = expr.loc();
        TokenRef {
            line: loc.line,
            column: loc.column,
            offset: loc.offset,
        }
    }

    fn token_u32(&self, expr: &Expr) -> u32 {
        expr.loc().offset
    }

    fn emit_undefined(&mut self, token: TokenRef) {
        let idx = self
            .scopes
            .last_mut()
            .unwrap()
            .add_constant(Value::undefined())
            .expect("constant pool overflow on undefined literal");
        self.chunk_mut().push_constant(idx, token.offset);
    }

    fn declare_local(&mut self, name: &str, mutable: bool) -> Result<u8, GabError> {
        let scope = self.scopes.last_mut().expect("no active scope");
        if scope.locals.len() >= u8::MAX as usize {
            return Err(GabError::runtime(GabStatus::TooManyLocals, "too many locals in one block"));
        }
        scope.locals.push(Local {
            name: name.to_string(),
            depth: scope.depth,
            initialized: false,
            captured: false,
            mutable,
        });
        Ok(scope.locals.len() as u8 - 1)
    }

    fn initialize_last_local(&mut self) {
        self.scopes.last_mut().unwrap().locals.last_mut().unwrap().initialized = true;
    }

    fn resolve_local(scope: &FnScope, name: &str) -> Option<(u8, bool, bool)> {
        scope
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, l)| (i as u8, l.initialized, l.mutable))
    }

    /// Resolves `name` as an upvalue of `self.scopes[scope_idx]`, walking
    /// outward and registering the capture chain as it returns, the
    /// standard closure-conversion recursive-resolve.
    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Result<Option<u8>, GabError> {
        if scope_idx == 0 {
            return Ok(None);
        }
        let parent_idx = scope_idx - 1;

        if let Some((slot, initialized, mutable)) = Self::resolve_local(&self.scopes[parent_idx], name) {
            if !initialized {
                return Err(GabError::syntax(
                    GabStatus::ReferenceBeforeInitialize,
                    TokenRef::default(),
                    format!("'{name}' referenced before it is initialized"),
                ));
            }
            if mutable {
                return Err(GabError::syntax(
                    GabStatus::CapturedMutable,
                    TokenRef::default(),
                    format!("blocks cannot capture mutable variable '{name}'"),
                ));
            }
            self.scopes[parent_idx].locals[slot as usize].captured = true;
            return Ok(Some(self.add_upvalue(scope_idx, name, true, slot)?));
        }

        if let Some(outer_slot) = self.resolve_upvalue(parent_idx, name)? {
            return Ok(Some(self.add_upvalue(scope_idx, name, false, outer_slot)?));
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, scope_idx: usize, name: &str, is_local: bool, index: u8) -> Result<u8, GabError> {
        let scope = &mut self.scopes[scope_idx];
        if let Some((i, _)) = scope.upvalues.iter().enumerate().find(|(_, u)| u.name == name) {
            return Ok(i as u8);
        }
        if scope.upvalues.len() >= u8::MAX as usize {
            return Err(GabError::runtime(GabStatus::TooManyUpvalues, "too many upvalues captured"));
        }
        scope.upvalues.push(Upvalue {
            name: name.to_string(),
            is_local,
            index,
        });
        Ok(scope.upvalues.len() as u8 - 1)
    }

    fn intern_message(&mut self, name: &str) -> Result<u16, GabError> {
        let id = self.tables.messages.intern(name);
        self.scopes.last_mut().unwrap().add_constant(Value::message(id))
    }

    fn intern_string(&mut self, s: &str) -> Result<u16, GabError> {
        let value = if let Some(inline) = Value::inline_string(s) {
            inline
        } else {
            let (id, heap) = self.tables.strings.intern(s);
            Value::heap_string(heap, id)
        };
        self.scopes.last_mut().unwrap().add_constant(value)
    }

    fn compile_expr(&mut self, expr: &Expr, tail: bool) -> Result<(), GabError> {
        let token = self.token_u32(expr);
        match expr {
            Expr::Literal(Literal::Number(n), _) => {
                let idx = self.scopes.last_mut().unwrap().add_constant(Value::from_f64(*n))?;
                self.chunk_mut().push_constant(idx, token);
            }
            Expr::Literal(Literal::String(s), _) => {
                let idx = self.intern_string(s)?;
                self.chunk_mut().push_constant(idx, token);
            }
            Expr::Literal(Literal::Sigil(name), _) => {
                let id = self.tables.intern_sigil(name);
                let idx = self.scopes.last_mut().unwrap().add_constant(Value::sigil(id))?;
                self.chunk_mut().push_constant(idx, token);
            }
            Expr::Ident(name, loc) => self.compile_ident_load(name, *loc, token)?,
            Expr::Assign { targets, values, .. } => self.compile_assign(targets, values, token)?,
            Expr::Block(block) => self.compile_block_literal(block, token)?,
            Expr::Tuple(items, _) => {
                for item in items {
                    self.compile_expr(item, false)?;
                }
                self.chunk_mut().make_tuple(items.len() as u8, token);
            }
            Expr::RecordLiteral { fields, .. } => {
                for (name, value) in fields {
                    let message_idx = self.intern_message(name)?;
                    self.chunk_mut().push_constant(message_idx, token);
                    self.compile_expr(value, false)?;
                }
                self.chunk_mut().make_record(fields.len() as u8, token);
            }
            Expr::Send {
                receiver,
                message,
                args,
                ..
            } => {
                self.compile_expr(receiver, false)?;
                for arg in args {
                    self.compile_expr(arg, false)?;
                }
                let message_idx = self.intern_message(message)?;
                let mut flags = SendFlags::default();
                if tail {
                    flags.0 |= SendFlags::TAIL;
                }
                if args.len() as u64 >= crate::limits::GAB_ARG_MAX as u64 {
                    return Err(GabError::runtime(
                        GabStatus::TooManyArguments,
                        format!("send of '{message}' has too many arguments"),
                    ));
                }
                let site = self.scopes.last_mut().unwrap().next_send_site();
                self.chunk_mut().send(message_idx, args.len() as u8, flags, site, token);
            }
        }
        Ok(())
    }

    fn compile_ident_load(&mut self, name: &str, loc: crate::ast::SourceLocation, token: u32) -> Result<(), GabError> {
        let scope_idx = self.scopes.len() - 1;
        if let Some((slot, initialized, _)) = Self::resolve_local(&self.scopes[scope_idx], name) {
            if !initialized {
                return Err(GabError::syntax(
                    GabStatus::ReferenceBeforeInitialize,
                    TokenRef {
                        line: loc.line,
                        column: loc.column,
                        offset: loc.offset,
                    },
                    format!("'{name}' referenced before it is initialized"),
                ));
            }
            self.chunk_mut().push_local(slot, token);
            return Ok(());
        }
        if let Some(slot) = self.resolve_upvalue(scope_idx, name)? {
            self.chunk_mut().push_upvalue(slot, token);
            return Ok(());
        }
        // Unresolved bare identifiers are zero-argument sends to the
        // block's implicit receiver (slot 0), so plain names double as
        // property/method access the way a message send to `self` would.
        self.chunk_mut().push_local(0, token);
        let message_idx = self.intern_message(name)?;
        let site = self.scopes.last_mut().unwrap().next_send_site();
        self.chunk_mut().send(message_idx, 0, SendFlags::default(), site, token);
        Ok(())
    }

    /// Compiles `targets = values` (spec's binding-and-assignment form).
    /// `values`'s length is always known here — every expression this
    /// compiler emits pushes exactly one stack value, so a comma-list
    /// RHS's count is fixed at parse time — which is what lets the
    /// splat branch below decide, without any runtime branching, how
    /// many of the pushed values are `below`/`above` the pack point and
    /// how many fall in the middle for `PackList`/`PackRecord` to
    /// absorb.
    fn compile_assign(&mut self, targets: &[AssignTarget], values: &[Expr], token: u32) -> Result<(), GabError> {
        for value in values {
            self.compile_expr(value, false)?;
        }

        match targets.iter().position(|t| t.splat.is_some()) {
            None => {
                self.chunk_mut().push_trim(targets.len() as u8, token);
            }
            Some(pos) => {
                let below = pos as u8;
                let above = (targets.len() - pos - 1) as u8;
                let floor = below as usize + above as usize;
                if values.len() < floor {
                    self.chunk_mut().push_trim(floor as u8, token);
                }
                match targets[pos].splat {
                    Some(SplatKind::List) => self.chunk_mut().push_pack_list(below, above, token),
                    Some(SplatKind::Record) => self.chunk_mut().push_pack_record(below, above, token),
                    None => unreachable!("splat_pos only set for a splat target"),
                }
            }
        }

        for target in targets.iter().rev() {
            self.store_assign_target(target, token)?;
        }
        Ok(())
    }

    fn store_assign_target(&mut self, target: &AssignTarget, token: u32) -> Result<(), GabError> {
        let scope_idx = self.scopes.len() - 1;
        if let Some((slot, _, mutable)) = Self::resolve_local(&self.scopes[scope_idx], &target.name) {
            if !mutable {
                return Err(GabError::syntax(
                    GabStatus::LocalAlreadyExists,
                    TokenRef {
                        line: target.loc.line,
                        column: target.loc.column,
                        offset: target.loc.offset,
                    },
                    format!("'{}' is already bound; reassignment requires declaring it mutable", target.name),
                ));
            }
            self.chunk_mut().store_local(slot, token);
            return Ok(());
        }
        if self.resolve_upvalue(scope_idx, &target.name)?.is_some() {
            return Err(GabError::syntax(
                GabStatus::CapturedMutable,
                TokenRef::default(),
                format!("'{}' is captured from an enclosing block and cannot be reassigned", target.name),
            ));
        }
        let slot = self.declare_local(&target.name, true)?;
        self.initialize_last_local();
        self.chunk_mut().store_local(slot, token);
        Ok(())
    }

    fn compile_block_literal(&mut self, block: &BlockLiteral, token: u32) -> Result<(), GabError> {
        if block.params.len() as u64 > crate::limits::GAB_ARG_MAX as u64 {
            return Err(GabError::runtime(GabStatus::TooManyParameters, "block has too many parameters"));
        }

        self.scopes.push(FnScope::new(Value::undefined()));
        self.declare_local("self", false)?;
        self.initialize_last_local();
        for param in &block.params {
            self.declare_local(param, false)?;
            self.initialize_last_local();
        }
        self.compile_body(&block.body)?;
        let narguments = block.params.len() as u8 + 1;
        let prototype = self.finish_current_scope(narguments)?;
        let nupvalues = prototype.upvalue_is_local.len();
        let (is_local, index): (Vec<bool>, Vec<u8>) = (prototype.upvalue_is_local.clone(), prototype.upvalue_index.clone());

        // Emit the upvalue-capturing instructions at the *enclosing*
        // scope before `MakeBlock`, so the VM can pop exactly
        // `nupvalues` values off the stack to build the closure's
        // environment array.
        for i in 0..nupvalues {
            if is_local[i] {
                self.chunk_mut().push_local(index[i], token);
            } else {
                self.chunk_mut().push_upvalue(index[i], token);
            }
        }

        let proto_idx = self.prototypes_out.len() as u16;
        self.prototypes_out.push(prototype);
        self.chunk_mut().make_block(proto_idx, token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> PrototypeData {
        let program = Parser::parse_source(src).unwrap();
        let tables = Arc::new(InternTables::new());
        Compiler::new(tables).compile_program(&program).unwrap().prototype
    }

    #[test]
    fn compiles_a_number_literal() {
        let proto = compile("42");
        assert!(!proto.bytecode.is_empty());
        assert_eq!(proto.constants.len(), 1);
    }

    #[test]
    fn compiles_arithmetic_send() {
        let proto = compile("1 + 2");
        assert!(proto.bytecode.contains(&(crate::opcode::Op::Send as u8)));
    }

    #[test]
    fn local_assignment_then_use_resolves_to_same_slot() {
        let proto = compile("x = 1\nx");
        // store_local then push_local should reference the same slot
        let store_slot = proto.bytecode[proto
            .bytecode
            .iter()
            .position(|&b| b == crate::opcode::Op::StoreLocal as u8)
            .unwrap()
            + 1];
        assert!(proto.bytecode.windows(2).any(|w| w == [crate::opcode::Op::PushLocal as u8, store_slot]));
    }

    #[test]
    fn multi_target_assignment_trims_then_stores_each_target() {
        let proto = compile("a, b = 1, 2\na");
        assert!(proto.bytecode.contains(&(crate::opcode::Op::Trim as u8)));
        let stores = proto.bytecode.iter().filter(|&&b| b == crate::opcode::Op::StoreLocal as u8).count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn splat_target_assignment_emits_pack_list() {
        let proto = compile("a, *rest = 1, 2, 3\nrest");
        assert!(proto.bytecode.contains(&(crate::opcode::Op::PackList as u8)));
    }

    #[test]
    fn record_splat_target_assignment_emits_pack_record() {
        let proto = compile("**rest = 1, 2\nrest");
        assert!(proto.bytecode.contains(&(crate::opcode::Op::PackRecord as u8)));
    }

    #[test]
    fn short_rhs_before_a_splat_pads_with_trim_first() {
        let proto = compile("a, b, *rest = 1\nrest");
        let trim_before_pack = proto
            .bytecode
            .iter()
            .position(|&b| b == crate::opcode::Op::Trim as u8)
            .zip(proto.bytecode.iter().position(|&b| b == crate::opcode::Op::PackList as u8));
        assert!(matches!(trim_before_pack, Some((t, p)) if t < p));
    }

    #[test]
    fn rejects_too_many_parameters() {
        let params: Vec<String> = (0..100).map(|i| format!("p{i}")).collect();
        let src = format!("|{}|\n1\nend", params.join(", "));
        let program = Parser::parse_source(&src).unwrap();
        let tables = Arc::new(InternTables::new());
        let result = Compiler::new(tables).compile_program(&program);
        assert!(result.is_err());
    }
}
