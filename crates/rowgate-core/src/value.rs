//! Runtime values for rows and claims.
//!
//! Claims arrive as JSON-like documents and rows are opaque column maps, so
//! both are modelled with one tagged variant. Comparison rules are explicit
//! and total: every pair of values either compares, is UNKNOWN (a NULL is
//! involved) or is a type mismatch.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A JSON-like runtime value.
///
/// Numbers are split into `Int` and `Float` so integer identifiers compare
/// exactly; the two kinds still compare with each other numerically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Null value.
    #[default]
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested object.
    Object(BTreeMap<String, Value>),
}

/// Kind tag of a value, used in type mismatch diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        };
        f.write_str(name)
    }
}

/// Result of comparing two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Both sides are comparable.
    Ordered(Ordering),
    /// At least one side is NULL.
    Unknown,
    /// The values cannot be compared with this operator.
    Mismatch(ValueKind, ValueKind),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) | Value::Float(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Check if the value can be written as an expression literal.
    pub fn has_source_form(&self) -> bool {
        match self {
            Value::Float(x) => x.is_finite(),
            Value::Array(items) => items.iter().all(Value::has_source_form),
            Value::Object(_) => false,
            _ => true,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as f64 (both numeric kinds).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Try to get as an array slice.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Try to get as an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Equality under the `=` operator.
    ///
    /// NULL on either side is `Unknown`; values of different kinds are a
    /// mismatch. Arrays and objects compare element-wise.
    pub fn equals(&self, other: &Value) -> Comparison {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Comparison::Unknown,
            (Value::Bool(a), Value::Bool(b)) => Comparison::Ordered(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Comparison::Ordered(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Comparison::Ordered(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                Self::compare_numbers(self, other)
            }
            (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
                if Self::same(self, other) {
                    Comparison::Ordered(Ordering::Equal)
                } else {
                    // Not equal; the direction is irrelevant for `=` and `!=`.
                    Comparison::Ordered(Ordering::Less)
                }
            }
            _ => Comparison::Mismatch(self.kind(), other.kind()),
        }
    }

    /// Ordering under `<`, `<=`, `>` and `>=`.
    ///
    /// Numbers order numerically, strings bytewise and `false < true`.
    /// Arrays and objects have no ordering.
    pub fn order(&self, other: &Value) -> Comparison {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => Comparison::Unknown,
            (Value::Bool(a), Value::Bool(b)) => Comparison::Ordered(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Comparison::Ordered(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Comparison::Ordered(a.cmp(b)),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                Self::compare_numbers(self, other)
            }
            _ => Comparison::Mismatch(self.kind(), other.kind()),
        }
    }

    /// Deep equality for array and object operands. Numbers compare
    /// numerically at any depth; nested NULLs are equal to each other.
    fn same(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(p, q)| Self::same(p, q))
            }
            (Value::Object(x), Value::Object(y)) => {
                x.len() == y.len()
                    && x
                        .iter()
                        .zip(y)
                        .all(|((ka, va), (kb, vb))| ka == kb && Self::same(va, vb))
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => matches!(
                Self::compare_numbers(a, b),
                Comparison::Ordered(Ordering::Equal)
            ),
            _ => a == b,
        }
    }

    fn compare_numbers(a: &Value, b: &Value) -> Comparison {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => match x.partial_cmp(&y) {
                Some(ord) => Comparison::Ordered(ord),
                // NaN never compares.
                None => Comparison::Unknown,
            },
            _ => Comparison::Mismatch(a.kind(), b.kind()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::String(s) => {
                f.write_str("'")?;
                for c in s.chars() {
                    match c {
                        '\'' => f.write_str("\\'")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        other => write!(f, "{}", other)?,
                    }
                }
                f.write_str("'")
            }
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            // Objects have no literal syntax; render as JSON for diagnostics.
            Value::Object(_) => match serde_json::to_string(self) {
                Ok(json) => f.write_str(&json),
                Err(_) => f.write_str("{...}"),
            },
        }
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T> From<Vec<T>> for Value
where
    T: Into<Value>,
{
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// A row: column name to value.
///
/// Opaque to the engine except for the columns a predicate references.
/// A missing column reads as NULL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    /// Set a column value.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.insert(column.into(), value.into());
    }

    /// Get a column value, if present.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for Row
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
