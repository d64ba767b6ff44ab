//! Generic engine values and the casting rules between them.
//!
//! Function parameters and return values cross the bridge as
//! [`serde_json::Value`]. Three strictness levels govern how a generic
//! value may be coerced into a typed field: `Strict` for values that are
//! already typed (engine rows, dynamic messages), `SameKind` for values
//! decoded from JSON (where every number may arrive as a float), and
//! `ConvertAll` for string-typed sources such as URI segments and
//! `text/plain` bodies.

use serde_json::Value;
use thiserror::Error;

/// How aggressively a generic value may be coerced into a target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Only the matching kind is accepted.
    Strict,
    /// Kinds of the same family are accepted (e.g. float to int).
    SameKind,
    /// Anything with a sensible string form is accepted.
    ConvertAll,
}

/// A failed coercion between a generic value and a target type.
#[derive(Debug, Clone, Error)]
#[error("cannot convert {kind}({repr}) to {target}")]
pub struct CastError {
    kind: &'static str,
    repr: String,
    target: String,
}

impl CastError {
    fn new(v: &Value, target: impl Into<String>) -> Self {
        CastError {
            kind: kind_name(v),
            repr: repr(v),
            target: target.into(),
        }
    }
}

pub type CastResult<T> = std::result::Result<T, CastError>;

/// Named-value lookup used when unfolding a single map parameter into
/// message fields. The rule engine's row types plug in here.
pub trait Row {
    fn value(&self, name: &str) -> Option<&Value>;
}

impl Row for serde_json::Map<String, Value> {
    fn value(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float64",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

fn repr(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn to_bool(v: &Value, sn: Strictness) -> CastResult<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if sn == Strictness::ConvertAll => {
            s.parse::<bool>().map_err(|_| CastError::new(v, "bool"))
        }
        _ => Err(CastError::new(v, "bool")),
    }
}

pub fn to_i64(v: &Value, sn: Strictness) -> CastResult<i64> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                match sn {
                    Strictness::Strict => Err(CastError::new(v, "int64")),
                    _ => Ok(f as i64),
                }
            } else {
                Err(CastError::new(v, "int64"))
            }
        }
        Value::String(s) if sn == Strictness::ConvertAll => {
            s.parse::<i64>().map_err(|_| CastError::new(v, "int64"))
        }
        _ => Err(CastError::new(v, "int64")),
    }
}

pub fn to_u64(v: &Value, sn: Strictness) -> CastResult<u64> {
    match v {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Ok(u)
            } else if let Some(f) = n.as_f64() {
                match sn {
                    Strictness::Strict => Err(CastError::new(v, "uint64")),
                    _ if f >= 0.0 => Ok(f as u64),
                    _ => Err(CastError::new(v, "uint64")),
                }
            } else {
                Err(CastError::new(v, "uint64"))
            }
        }
        Value::String(s) if sn == Strictness::ConvertAll => {
            s.parse::<u64>().map_err(|_| CastError::new(v, "uint64"))
        }
        _ => Err(CastError::new(v, "uint64")),
    }
}

pub fn to_f64(v: &Value, sn: Strictness) -> CastResult<f64> {
    match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| CastError::new(v, "float64")),
        Value::String(s) if sn == Strictness::ConvertAll => {
            s.parse::<f64>().map_err(|_| CastError::new(v, "float64"))
        }
        _ => Err(CastError::new(v, "float64")),
    }
}

pub fn to_string_value(v: &Value, sn: Strictness) -> CastResult<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) if sn == Strictness::ConvertAll => Ok(n.to_string()),
        Value::Bool(b) if sn == Strictness::ConvertAll => Ok(b.to_string()),
        _ => Err(CastError::new(v, "string")),
    }
}

pub fn to_bytes(v: &Value, sn: Strictness) -> CastResult<Vec<u8>> {
    match v {
        Value::String(s) => Ok(s.clone().into_bytes()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let b = to_u64(item, sn).map_err(|_| CastError::new(v, "bytes"))?;
                if b > u8::MAX as u64 {
                    return Err(CastError::new(v, "bytes"));
                }
                out.push(b as u8);
            }
            Ok(out)
        }
        _ => Err(CastError::new(v, "bytes")),
    }
}

/// Element-wise cast of an array value into a typed vector.
pub fn to_typed_slice<T, F>(v: &Value, f: F, target: &str, sn: Strictness) -> CastResult<Vec<T>>
where
    F: Fn(&Value, Strictness) -> CastResult<T>,
{
    let Value::Array(items) = v else {
        return Err(CastError::new(v, format!("{target} slice")));
    };
    items.iter().map(|item| f(item, sn)).collect()
}
