//! Value marshaling between the caller's dynamic values and engine columns.
//!
//! On the wire every value is plain JSON. Byte sequences travel as arrays of
//! integers in `0..=255`, which is also how the marshaler recognizes a blob
//! when it reads bind parameters.
//!
//! ```text
//! | Caller value          | Bound as   | Read back as      |
//! |-----------------------|------------|-------------------|
//! | integer / whole float | INTEGER    | Value::Integer    |
//! | fractional float      | REAL       | Value::Real       |
//! | bool                  | INTEGER    | Value::Integer    |
//! | string                | TEXT       | Value::Text       |
//! | array of bytes        | BLOB       | Value::Blob       |
//! | null                  | NULL       | Value::Null       |
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

/// Errors raised while converting caller values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarshalError {
    /// The value has a shape that cannot be bound to a parameter.
    #[error("wrong API use: tried to bind a value of an unknown type ({0})")]
    UnknownType(String),

    /// The parameter container is neither a sequence nor a mapping.
    #[error("could not bind unknown object type ({0})")]
    UnknownParams(String),
}

/// A dynamic value as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Convert a JSON value into a caller value.
    ///
    /// Arrays are only accepted when every element is a byte.
    pub fn from_json(json: &JsonValue) -> Result<Self, MarshalError> {
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Real(f))
                } else {
                    Err(MarshalError::UnknownType(n.to_string()))
                }
            }
            JsonValue::String(s) => Ok(Value::Text(s.clone())),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or_else(|| MarshalError::UnknownType(json.to_string()))
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(Value::Blob),
            JsonValue::Object(_) => Err(MarshalError::UnknownType(json.to_string())),
        }
    }

    /// Convert into the JSON wire representation.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Real(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Blob(bytes) => JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Value::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Parameters for a bind: positional (1-based) or by name.
///
/// Names include their sigil (`:name`, `@name`, `$name`) and keep the order
/// they were given in.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Positional(Vec<Value>),
    Named(IndexMap<String, Value>),
}

impl Params {
    pub fn from_json(json: &JsonValue) -> Result<Self, MarshalError> {
        match json {
            JsonValue::Array(items) => items
                .iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Params::Positional),
            JsonValue::Object(map) => map
                .iter()
                .map(|(name, v)| Value::from_json(v).map(|v| (name.clone(), v)))
                .collect::<Result<IndexMap<_, _>, _>>()
                .map(Params::Named),
            other => Err(MarshalError::UnknownParams(other.to_string())),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Params::Positional(values) => JsonValue::Array(values.iter().map(Value::to_json).collect()),
            Params::Named(values) => JsonValue::Object(
                values
                    .iter()
                    .map(|(name, v)| (name.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Params::Named(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Build positional parameters from a list of convertible values.
#[macro_export]
macro_rules! params {
    () => {
        $crate::value::Params::Positional(Vec::new())
    };
    ($($value:expr),+ $(,)?) => {
        $crate::value::Params::Positional(vec![$($crate::value::Value::from($value)),+])
    };
}

/// The engine-side representation a value is bound with.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Apply the binding rule: whole numbers bind as integers, booleans as 0/1.
pub fn to_bind(value: &Value) -> Bind {
    match value {
        Value::Null => Bind::Null,
        Value::Bool(b) => Bind::Integer(i64::from(*b)),
        Value::Integer(i) => Bind::Integer(*i),
        Value::Real(f) => {
            if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                Bind::Integer(*f as i64)
            } else {
                Bind::Real(*f)
            }
        }
        Value::Text(s) => Bind::Text(s.clone()),
        Value::Blob(b) => Bind::Blob(b.clone()),
    }
}
