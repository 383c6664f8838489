#![allow(clippy::result_large_err)] // Typed accessors return AppError so mismatches carry the same diagnostics as other engine failures.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value};
use std::collections::BTreeMap;

/// Reference to a value owned outside the engine (file handle, model session, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpaqueHandle {
    pub kind: String,
    pub id: String,
}

impl OpaqueHandle {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Dynamically typed workflow variable.
///
/// Equality is structural; floats compare by bit pattern so a restored
/// snapshot equals the original only when it is bit-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    #[default]
    Null,
    String(String),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Bool(bool),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
    Opaque(OpaqueHandle),
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StateValue::Null, StateValue::Null) => true,
            (StateValue::String(a), StateValue::String(b)) => a == b,
            (StateValue::Int(a), StateValue::Int(b)) => a == b,
            (StateValue::Float(a), StateValue::Float(b)) => a.to_bits() == b.to_bits(),
            (StateValue::Bool(a), StateValue::Bool(b)) => a == b,
            (StateValue::List(a), StateValue::List(b)) => a == b,
            (StateValue::Map(a), StateValue::Map(b)) => a == b,
            (StateValue::Opaque(a), StateValue::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for StateValue {}

impl StateValue {
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::String(_) => "string",
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::Bool(_) => "bool",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
            StateValue::Opaque(_) => "opaque",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StateValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, StateValue>> {
        match self {
            StateValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Convert into the requested Rust type without coercion.
    pub fn extract<T: FromStateValue>(&self) -> Result<T, AppError> {
        T::from_state_value(self).ok_or_else(|| type_mismatch(T::KIND, self.kind()))
    }

    /// Convert a JSON/YAML value into a state value.
    ///
    /// Integers that fit `i64` stay integers; everything else numeric becomes a float.
    /// Objects of the exact shape `{"$opaque": kind, "id": id}` become opaque handles.
    pub fn from_json(value: &Value) -> StateValue {
        match value {
            Value::Null => StateValue::Null,
            Value::Bool(b) => StateValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    StateValue::Int(i)
                } else {
                    StateValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => StateValue::String(s.clone()),
            Value::Array(items) => StateValue::List(items.iter().map(StateValue::from_json).collect()),
            Value::Object(map) => {
                if map.len() == 2 {
                    if let (Some(Value::String(kind)), Some(Value::String(id))) =
                        (map.get("$opaque"), map.get("id"))
                    {
                        return StateValue::Opaque(OpaqueHandle::new(kind.clone(), id.clone()));
                    }
                }
                StateValue::Map(
                    map.iter()
                        .map(|(key, child)| (key.clone(), StateValue::from_json(child)))
                        .collect(),
                )
            }
        }
    }

    /// Lossy projection used by renderers and logs; non-finite floats become strings.
    pub fn to_json(&self) -> Value {
        match self {
            StateValue::Null => Value::Null,
            StateValue::String(s) => Value::String(s.clone()),
            StateValue::Int(i) => Value::Number(Number::from(*i)),
            StateValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::List(items) => Value::Array(items.iter().map(StateValue::to_json).collect()),
            StateValue::Map(map) => {
                let mut json = JsonMap::new();
                for (key, child) in map {
                    json.insert(key.clone(), child.to_json());
                }
                Value::Object(json)
            }
            StateValue::Opaque(handle) => {
                let mut json = JsonMap::new();
                json.insert("$opaque".to_string(), Value::String(handle.kind.clone()));
                json.insert("id".to_string(), Value::String(handle.id.clone()));
                Value::Object(json)
            }
        }
    }
}

pub(crate) fn type_mismatch(expected: &str, actual: &str) -> AppError {
    AppError::new(
        ErrorCategory::TypeMismatch,
        format!("expected {} value, found {}", expected, actual),
    )
    .with_code("GRF-TYPE-001")
}

/// Conversion from a [`StateValue`] that never coerces between kinds.
pub trait FromStateValue: Sized {
    const KIND: &'static str;

    fn from_state_value(value: &StateValue) -> Option<Self>;
}

impl FromStateValue for StateValue {
    const KIND: &'static str = "any";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromStateValue for String {
    const KIND: &'static str = "string";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromStateValue for i64 {
    const KIND: &'static str = "int";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        value.as_int()
    }
}

impl FromStateValue for f64 {
    const KIND: &'static str = "float";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        match value {
            StateValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl FromStateValue for bool {
    const KIND: &'static str = "bool";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FromStateValue for Vec<StateValue> {
    const KIND: &'static str = "list";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        value.as_list().map(<[StateValue]>::to_vec)
    }
}

impl FromStateValue for BTreeMap<String, StateValue> {
    const KIND: &'static str = "map";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        value.as_map().cloned()
    }
}

impl FromStateValue for OpaqueHandle {
    const KIND: &'static str = "opaque";

    fn from_state_value(value: &StateValue) -> Option<Self> {
        match value {
            StateValue::Opaque(handle) => Some(handle.clone()),
            _ => None,
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        StateValue::Int(value as i64)
    }
}

impl From<usize> for StateValue {
    fn from(value: usize) -> Self {
        StateValue::Int(value as i64)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<OpaqueHandle> for StateValue {
    fn from(value: OpaqueHandle) -> Self {
        StateValue::Opaque(value)
    }
}

impl<T: Into<StateValue>> From<Vec<T>> for StateValue {
    fn from(value: Vec<T>) -> Self {
        StateValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, StateValue>> for StateValue {
    fn from(value: BTreeMap<String, StateValue>) -> Self {
        StateValue::Map(value)
    }
}

/// Floats are stored as JSON numbers when finite and as marker strings otherwise,
/// so checkpoints of NaN or infinite values survive a save/load cycle.
mod float_repr {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        struct FloatVisitor;

        impl<'de> Visitor<'de> for FloatVisitor {
            type Value = f64;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a float or one of NaN, inf, -inf")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
                match v {
                    "NaN" => Ok(f64::NAN),
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    other => Err(E::custom(format!("invalid float marker '{}'", other))),
                }
            }
        }

        deserializer.deserialize_any(FloatVisitor)
    }
}
