//! Runtime values
//!
//! Values are what flows through an interception point: call arguments,
//! results, upvalue cells, and the function references handed back by
//! `install`.

use crate::identity::CallableId;
use crate::runtime::ObjectId;
use std::fmt;

/// A runtime value passed to and returned from callables
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    S64(i64),
    F64(f64),
    String(String),
    List(Vec<Value>),

    // References into the registry
    Function(CallableId),
    Object(ObjectId),
}

impl Value {
    /// Script-facing type name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::S64(_) | Value::F64(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything except `nil` and `false` is truthy
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_function(&self) -> Option<CallableId> {
        match self {
            Value::Function(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON document value (scenario arguments) into a runtime value.
    ///
    /// Integers become `S64`, other numbers `F64`, objects are not representable
    /// and map to `Nil`.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::S64(i),
                None => Value::F64(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::Nil,
        }
    }

    /// Render as JSON for trace output. References render as tagged strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::S64(n) => serde_json::json!(n),
            Value::F64(n) => serde_json::json!(n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Function(id) => serde_json::Value::String(id.to_string()),
            Value::Object(id) => serde_json::Value::String(id.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::S64(n) => write!(f, "{}", n),
            Value::F64(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Function(id) => write!(f, "{}", id),
            Value::Object(id) => write!(f, "{}", id),
        }
    }
}

// ============================================================================
// From implementations
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::S64(v as i64) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::S64(v) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::F64(v) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}

impl From<CallableId> for Value {
    fn from(v: CallableId) -> Self { Value::Function(v) }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self { Value::Object(v) }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(x) => x.into(),
            None => Value::Nil,
        }
    }
}

// ============================================================================
// TryFrom implementations
// ============================================================================

/// Error converting a [`Value`] into a concrete Rust type
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionError {
    pub expected: &'static str,
    pub got: &'static str,
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected {}, got {}", self.expected, self.got)
    }
}

impl std::error::Error for ConversionError {}

impl TryFrom<Value> for i64 {
    type Error = ConversionError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::S64(n) => Ok(n),
            other => Err(ConversionError { expected: "integer", got: other.type_name() }),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = ConversionError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::F64(n) => Ok(n),
            Value::S64(n) => Ok(n as f64),
            other => Err(ConversionError { expected: "number", got: other.type_name() }),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = ConversionError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::Bool(b) => Ok(b),
            other => Err(ConversionError { expected: "boolean", got: other.type_name() }),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = ConversionError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        match v {
            Value::String(s) => Ok(s),
            other => Err(ConversionError { expected: "string", got: other.type_name() }),
        }
    }
}
