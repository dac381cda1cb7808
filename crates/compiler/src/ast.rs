//! The abstract syntax tree the parser produces.
//!
//! Node shapes follow spec §4.3: every expression is either a literal, a
//! tuple, or a message send (`receiver message arg, arg, ...`); the two
//! special forms `=` (assignment) and `=>` (block literal) are parsed
//! into their own node kinds rather than generic sends, since they need
//! dedicated codegen (a local-slot write, and closure conversion).

use gab_core::Value;

/// 1-indexed for display (matches source editors), 0-indexed internally
/// is not needed here since we just carry the token's own line/column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
    Sigil(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockLiteral {
    pub params: Vec<String>,
    pub body: Vec<Expr>,
    pub loc: SourceLocation,
}

/// How a single assignment target gathers values beyond its own: `*v`
/// collects the run of unclaimed positional values into a list-shaped
/// record, `**v` into a record-shaped one. At most one target in a
/// given assignment may carry either (spec §4.3's "at most one splat").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplatKind {
    List,
    Record,
}

/// One pattern on the LHS of `=`. A plain target (`splat: None`) binds
/// exactly one value; a splat target absorbs every value not claimed by
/// the other targets in the same assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignTarget {
    pub name: String,
    pub splat: Option<SplatKind>,
    pub loc: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal, SourceLocation),
    Ident(String, SourceLocation),
    /// `receiver message arg0, arg1, ...`
    Send {
        receiver: Box<Expr>,
        message: String,
        args: Vec<Expr>,
        loc: SourceLocation,
    },
    /// `target, target, ... = value, value, ...`, the assignment
    /// special form. `values` is a comma-separated list rather than one
    /// expression so a multi-target assignment's RHS count is known at
    /// parse time (spec's "RHS is compiled, trim-adjusted to the number
    /// of targets").
    Assign {
        targets: Vec<AssignTarget>,
        values: Vec<Expr>,
        loc: SourceLocation,
    },
    /// `|params| body end`, the block-literal special form.
    Block(BlockLiteral),
    /// `(a, b, c)`
    Tuple(Vec<Expr>, SourceLocation),
    /// `record[key: value, ...]`-style literal, sugar for repeated
    /// `make` sends during codegen.
    RecordLiteral {
        fields: Vec<(String, Expr)>,
        loc: SourceLocation,
    },
}

impl Expr {
    pub fn loc(&self) -> SourceLocation {
        match self {
            Expr::Literal(_, loc)
            | Expr::Ident(_, loc)
            | Expr::Send { loc, .. }
            | Expr::Assign { loc, .. }
            | Expr::Tuple(_, loc)
            | Expr::RecordLiteral { loc, .. } => *loc,
            Expr::Block(b) => b.loc,
        }
    }

    /// The sigil name a diagnostic or debug dump should tag this node
    /// with (`"send"`, `"block"`, ...). A plain string, not a Gab value —
    /// for an actual AST-as-data record see the compiler's own test
    /// helpers, not this.
    pub fn debug_tag(&self) -> &'static str {
        match self {
            Expr::Literal(Literal::Number(_), _) => "number",
            Expr::Literal(Literal::String(_), _) => "string",
            Expr::Literal(Literal::Sigil(_), _) => "sigil",
            Expr::Ident(_, _) => "identifier",
            Expr::Send { .. } => "send",
            Expr::Assign { .. } => "assign",
            Expr::Block(_) => "block",
            Expr::Tuple(_, _) => "tuple",
            Expr::RecordLiteral { .. } => "record",
        }
    }
}

/// A compiled program's entry point: a single top-level block wrapping
/// every statement given to the compiler, matching how the reference
/// engine always compiles a source unit into one implicit closure.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Expr>,
}

/// A node-kind tag value, used only by tests/debugging; the committed
/// `Value` type this would eventually map onto is `gab_core::Value`.
pub fn placeholder_value() -> Value {
    Value::undefined()
}
