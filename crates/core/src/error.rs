//! Status codes and the runtime's error type.
//!
//! No `thiserror`/`anyhow` here: a hand-written enum with manual `Display`
//! and `std::error::Error` impls, matching the rest of this workspace.

use std::fmt;
use std::sync::Arc;

use crate::intern::InternTables;
use crate::record::RecordData;
use crate::shape::ShapeRegistry;
use crate::value::{HeapObject, Value, ValueKind};

/// The full taxonomy of things that can go wrong, compile-time and
/// run-time alike. Mirrors `gab_status` one-for-one in meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GabStatus {
    Ok,
    Panic,
    MalformedString,
    MalformedToken,
    UnexpectedToken,
    CapturedMutable,
    BreakOutsideLoop,
    TooManyVariablesInDef,
    InvalidImplicit,
    TooManyLocals,
    TooManyUpvalues,
    TooManyParameters,
    TooManyArguments,
    TooManyReturnValues,
    TooManyExpressions,
    TooManyExpressionsInInitializer,
    ReferenceBeforeInitialize,
    LocalAlreadyExists,
    ExpressionNotAssignable,
    MissingEnd,
    MissingInitializer,
    MissingIdentifier,
    MissingReceiver,
    NotNumber,
    NotRecord,
    NotString,
    NotMessage,
    NotCallable,
    Overflow,
    ImplementationExists,
    ImplementationMissing,
}

impl GabStatus {
    /// Default human-readable message for this status, used when a
    /// site doesn't supply its own note.
    pub fn default_message(self) -> &'static str {
        use GabStatus::*;
        match self {
            Ok => "ok",
            Panic => "A fatal error occurred",
            MalformedString => "Unexpected character in string literal",
            MalformedToken => "Unrecognized token",
            UnexpectedToken => "Unexpected token",
            CapturedMutable => "Blocks cannot capture mutable variables",
            BreakOutsideLoop => "Cannot break outside a loop",
            TooManyVariablesInDef => "Cannot define more than 16 variables",
            InvalidImplicit => "Cannot implicitly add parameters after locals",
            TooManyLocals => "Blocks cannot have more than 255 locals",
            TooManyUpvalues => "Blocks cannot capture more than 255 locals",
            TooManyParameters => "Blocks cannot have more than 16 parameters",
            TooManyArguments => "Block calls cannot have more than 16 arguments",
            TooManyReturnValues => "Blocks cannot return more than 16 values",
            TooManyExpressions => "Expected fewer expressions",
            TooManyExpressionsInInitializer => {
                "Record literals cannot initialize more than 255 properties"
            }
            ReferenceBeforeInitialize => {
                "Variables cannot be referenced before they are initialized"
            }
            LocalAlreadyExists => "A local with this name already exists",
            ExpressionNotAssignable => "The expression on the left is not assignable",
            MissingEnd => "Block needs a corresponding 'end'",
            MissingInitializer => "Variables must be initialized",
            MissingIdentifier => "Identifier could not be resolved",
            MissingReceiver => "A message definition should specify a receiver",
            NotNumber => "Expected a number",
            NotRecord => "Expected a record",
            NotString => "Expected a string",
            NotMessage => "Expected a message",
            NotCallable => "Expected a callable value",
            Overflow => "Reached maximum call depth",
            ImplementationExists => "Implementation already exists",
            ImplementationMissing => "Implementation does not exist",
        }
    }
}

impl fmt::Display for GabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_message())
    }
}

/// A reference to the token/source span an error occurred at. Kept as
/// plain indices rather than a borrowed slice so `GabError` stays `'static`
/// and can cross fiber boundaries freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenRef {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
}

/// The runtime's single error type. The VM itself never unwinds on this;
/// `GabError` is how the compiler and embedding surface report failure,
/// and `to_record` is how a `GabError` becomes the `err` value a fiber
/// can resolve to (see `gab-runtime`'s failure-as-value model).
#[derive(Debug, Clone, PartialEq)]
pub enum GabError {
    Syntax {
        status: GabStatus,
        token: TokenRef,
        note: String,
    },
    Binding {
        status: GabStatus,
        token: TokenRef,
        note: String,
    },
    Type {
        status: GabStatus,
        found: ValueKind,
        expected: ValueKind,
    },
    Dispatch {
        receiver_kind: ValueKind,
        message: String,
    },
    Runtime {
        status: GabStatus,
        note: String,
    },
    Resource {
        status: GabStatus,
        note: String,
    },
}

impl GabError {
    pub fn status(&self) -> GabStatus {
        match self {
            GabError::Syntax { status, .. }
            | GabError::Binding { status, .. }
            | GabError::Runtime { status, .. }
            | GabError::Resource { status, .. } => *status,
            GabError::Type { status, .. } => *status,
            GabError::Dispatch { .. } => GabStatus::ImplementationMissing,
        }
    }

    pub fn syntax(status: GabStatus, token: TokenRef, note: impl Into<String>) -> Self {
        GabError::Syntax {
            status,
            token,
            note: note.into(),
        }
    }

    pub fn runtime(status: GabStatus, note: impl Into<String>) -> Self {
        GabError::Runtime {
            status,
            note: note.into(),
        }
    }

    /// Materializes this error as the canonical `err` detail record,
    /// `{status: <name>, message: <text>}` — slot 1 of a fiber's
    /// `[err, ...]` result. Takes the intern tables and shape registry
    /// directly rather than a whole `Engine` so this stays usable from
    /// host-level error reporting that never spins up a fiber at all;
    /// `gab-runtime` builds the outer `[err, ...]` tuple around whatever
    /// this returns.
    pub fn to_record(&self, tables: &InternTables, shapes: &ShapeRegistry) -> Value {
        let status_key = tables.messages.intern("status");
        let message_key = tables.messages.intern("message");
        let status = intern_string(tables, &self.status().to_string());
        let message = intern_string(tables, &self.to_string());

        let mut shape = shapes.root();
        let mut record = RecordData::empty(shape);
        shape = shapes.transition(shape, status_key);
        record = record.push(shape, status);
        shape = shapes.transition(shape, message_key);
        record = record.push(shape, message);

        Value::record(Arc::new(HeapObject::Record(record)))
    }
}

fn intern_string(tables: &InternTables, s: &str) -> Value {
    if let Some(inline) = Value::inline_string(s) {
        inline
    } else {
        let (id, heap) = tables.strings.intern(s);
        Value::heap_string(heap, id)
    }
}

impl fmt::Display for GabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GabError::Syntax { status, token, note } | GabError::Binding { status, token, note } => {
                write!(f, "{status} at {}:{}: {note}", token.line, token.column)
            }
            GabError::Type { status, found, expected } => {
                write!(f, "{status}: expected {expected:?}, found {found:?}")
            }
            GabError::Dispatch {
                receiver_kind,
                message,
            } => write!(
                f,
                "no implementation of `{message}` for a {receiver_kind:?}"
            ),
            GabError::Runtime { status, note } | GabError::Resource { status, note } => {
                write!(f, "{status}: {note}")
            }
        }
    }
}

impl std::error::Error for GabError {}

impl From<String> for GabError {
    fn from(note: String) -> Self {
        GabError::runtime(GabStatus::Panic, note)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;

    #[test]
    fn to_record_carries_status_and_message_fields() {
        let tables = InternTables::new();
        let shapes = ShapeRegistry::new();
        let err = GabError::Dispatch {
            receiver_kind: ValueKind::Number,
            message: "greet".into(),
        };
        let record = err.to_record(&tables, &shapes);
        assert_eq!(record.kind(), ValueKind::Record);
        let Some(HeapObject::Record(data)) = record.heap_object() else {
            panic!("to_record must produce a Record-kind value");
        };
        assert_eq!(data.len(), 2);
    }
}
