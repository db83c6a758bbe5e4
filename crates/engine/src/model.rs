use std::fmt;
use serde::{Serialize, Deserialize};

/// A scalar cell of the output table.
///
/// Absent cells are represented as `Option::<Value>::None` by callers; there is
/// no "null" variant so that absence can never be mistaken for a zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Coerce an unquoted status-line value: integer when there is no `.`,
    /// float otherwise, opaque string if neither parses.
    pub fn parse(raw: &str) -> Value {
        if raw.contains('.') {
            if let Ok(f) = raw.parse::<f64>() {
                return Value::Float(f);
            }
        } else if let Ok(i) = raw.parse::<i64>() {
            return Value::Int(i);
        }
        Value::Str(raw.to_string())
    }

    /// Numeric view used by aggregation. Strings are never numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
