//! Gab Compiler: lexer, parser, and bytecode compiler.
//!
//! `compile_source` is the single entry point the runtime calls: source
//! text in, a [`compiler::CompiledUnit`] (prototype + nested prototypes)
//! or a [`gab_core::GabError`] out. The VM never sees source text or an
//! AST, only the bytecode this crate produces.

pub mod ast;
pub mod compiler;
pub mod lexer;
pub mod limits;
pub mod opcode;
pub mod parser;

use std::sync::Arc;

use gab_core::{GabError, InternTables};

pub use compiler::CompiledUnit;

pub fn compile_source(src: &str, tables: Arc<InternTables>) -> Result<CompiledUnit, GabError> {
    let program = parser::Parser::parse_source(src).map_err(|note| {
        GabError::syntax(gab_core::GabStatus::UnexpectedToken, gab_core::TokenRef::default(), note)
    })?;
    compiler::Compiler::new(tables).compile_program(&program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_an_end_to_end_source_unit() {
        let tables = Arc::new(InternTables::new());
        let unit = compile_source("1 + 2", tables).unwrap();
        assert!(!unit.prototype.bytecode.is_empty());
    }

    #[test]
    fn surfaces_syntax_errors_as_gab_error() {
        let tables = Arc::new(InternTables::new());
        let result = compile_source("1 = 2", tables);
        assert!(result.is_err());
    }
}
