//! Built-in message implementations for the primitive kinds (numbers,
//! records, blocks) that every Gab program can send without a `def`.
//!
//! Grounded on the operation set this workspace's original arithmetic
//! module exposed (`add`/`subtract`/`multiply`/`divide`/comparisons),
//! reshaped from C-ABI stack-effect functions into ordinary Rust
//! functions over [`gab_core::Value`] dispatched by message name rather
//! than by a fixed opcode, since Gab resolves `+`/`-`/... through the
//! same generic send path as any user-defined message.

use gab_core::{GabError, GabStatus, Value, ValueKind};

use crate::engine::Engine;

/// Tries to handle `message` sent to a `Number` receiver. Returns
/// `None` if `message` isn't one of the built-in numeric operators, so
/// the caller can fall back to dispatch-miss handling.
pub fn number_send(engine: &Engine, receiver: f64, message: &str, args: &[Value]) -> Option<Result<Value, GabError>> {
    let arg = |i: usize| args.get(i).and_then(Value::as_f64);

    let result = match message {
        "+" => arg(0).map(|b| Value::from_f64(receiver + b)),
        "-" => arg(0).map(|b| Value::from_f64(receiver - b)),
        "*" => arg(0).map(|b| Value::from_f64(receiver * b)),
        "/" => arg(0).map(|b| Value::from_f64(receiver / b)),
        "%" => arg(0).map(|b| Value::from_f64(receiver % b)),
        "neg" => Some(Value::from_f64(-receiver)),
        "==" => arg(0).map(|b| engine.bool_value(receiver == b)),
        "!=" => arg(0).map(|b| engine.bool_value(receiver != b)),
        "<" => arg(0).map(|b| engine.bool_value(receiver < b)),
        ">" => arg(0).map(|b| engine.bool_value(receiver > b)),
        "<=" => arg(0).map(|b| engine.bool_value(receiver <= b)),
        ">=" => arg(0).map(|b| engine.bool_value(receiver >= b)),
        "floor" => Some(Value::from_f64(receiver.floor())),
        "ceil" => Some(Value::from_f64(receiver.ceil())),
        "abs" => Some(Value::from_f64(receiver.abs())),
        "to_s" => {
            let text = format_number(receiver);
            Some(engine.make_string(&text))
        }
        _ => return None,
    };

    Some(result.ok_or_else(|| {
        GabError::Type {
            status: GabStatus::NotNumber,
            found: args.first().map(Value::kind).unwrap_or(ValueKind::Number),
            expected: ValueKind::Number,
        }
    }))
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Engine {
        Engine::new_for_test(EngineConfig::default())
    }

    #[test]
    fn adds_two_numbers() {
        let eng = engine();
        let result = number_send(&eng, 1.0, "+", &[Value::from_f64(2.0)]).unwrap().unwrap();
        assert_eq!(result.as_f64(), Some(3.0));
    }

    #[test]
    fn comparison_yields_a_bool_sigil() {
        let eng = engine();
        let result = number_send(&eng, 1.0, "<", &[Value::from_f64(2.0)]).unwrap().unwrap();
        assert_eq!(result.sigil_id(), Some(eng.true_sigil_id));
    }

    #[test]
    fn unknown_message_returns_none() {
        let eng = engine();
        assert!(number_send(&eng, 1.0, "frobnicate", &[]).is_none());
    }
}
