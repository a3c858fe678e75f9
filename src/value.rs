//! Values exchanged with the script across the dispatch boundary.
//!
//! The interpreter owns the real marshalling; this is the host-side view
//! of an argument or result, plus the argument helpers every capability
//! uses to validate its inputs before doing anything.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::dispatch::{CallError, HostObject};

/// A script-visible value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// Raw byte string (binary file reads, binary websocket frames).
    Bytes(Vec<u8>),
    /// Sequence table (1-based on the script side).
    List(Vec<Value>),
    /// String-keyed table.
    Map(BTreeMap<String, Value>),
    /// Callable host object (file handle, websocket handle).
    Object(Arc<dyn HostObject>),
}

impl Value {
    /// Type name as the script sees it, used in "bad argument" messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::String(_) | Value::Bytes(_) => "string",
            Value::List(_) | Value::Map(_) | Value::Object(_) => "table",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn HostObject>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Coerces a value to text the way a script's `tostring` would for
    /// writes: strings verbatim, numbers and booleans formatted, nil empty.
    pub fn to_text(&self) -> String {
        match self {
            Value::Nil => String::new(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::String(a), Value::Bytes(b)) | (Value::Bytes(b), Value::String(a)) => {
                a.as_bytes() == b.as_slice()
            }
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Integer(i) => write!(f, "Integer({i})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::List(l) => f.debug_tuple("List").field(l).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(m).finish(),
            Value::Object(o) => write!(f, "Object({:?})", o.method_names()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Value::List(l) => write!(f, "table: {} entries", l.len()),
            Value::Map(m) => write!(f, "table: {} keys", m.len()),
            Value::Object(_) => write!(f, "object"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Integer(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::String).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

// ── Argument helpers ──────────────────────────────────

/// Positional view over call arguments.
///
/// Every getter reports failures with the 1-based argument index, so a
/// handler can validate all of its inputs with `?` before any side effect.
#[derive(Clone, Copy)]
pub struct Args<'a> {
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(values: &'a [Value]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Argument at `index`, or nil if absent.
    pub fn get(&self, index: usize) -> &'a Value {
        const NIL: &Value = &Value::Nil;
        self.values.get(index).unwrap_or(NIL)
    }

    pub fn string(&self, index: usize) -> Result<&'a str, CallError> {
        let value = self.get(index);
        value
            .as_str()
            .ok_or_else(|| CallError::bad_argument(index, "string", value))
    }

    pub fn opt_string(&self, index: usize) -> Result<Option<&'a str>, CallError> {
        match self.get(index) {
            Value::Nil => Ok(None),
            _ => self.string(index).map(Some),
        }
    }

    /// A finite number.
    pub fn real(&self, index: usize) -> Result<f64, CallError> {
        let value = self.get(index);
        match value.as_f64() {
            Some(n) if n.is_finite() => Ok(n),
            Some(_) => Err(CallError::BadArgument {
                index: index + 1,
                expected: "number",
                got: "nan".to_string(),
            }),
            None => Err(CallError::bad_argument(index, "number", value)),
        }
    }

    /// A number truncated towards zero.
    pub fn int(&self, index: usize) -> Result<i64, CallError> {
        self.real(index).map(|n| n as i64)
    }

    pub fn opt_map(&self, index: usize) -> Result<Option<&'a BTreeMap<String, Value>>, CallError> {
        match self.get(index) {
            Value::Nil => Ok(None),
            Value::Map(m) => Ok(Some(m)),
            other => Err(CallError::bad_argument(index, "table", other)),
        }
    }

    /// Arguments from `from` onwards, cloned.
    pub fn rest(&self, from: usize) -> Vec<Value> {
        self.values.get(from..).map(<[Value]>::to_vec).unwrap_or_default()
    }
}
