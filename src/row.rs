//! Row and value model.
//!
//! A [`Row`] is an ordered mapping from column name to [`Value`]. Values are
//! drawn from the sum {null, boolean, finite number, string, JSON-compatible
//! structured value}; rows are immutable once produced by an iterator.
//!
//! Values carry a SQLite-style total order (NULL < booleans < numbers <
//! strings < JSON) so that any PK-complete sort over rows is total.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single cell value.
///
/// Numbers are always finite; the source layer rejects NaN/infinity and
/// integers that do not fit double precision before a `Value` is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Json(serde_json::Value),
}

impl Value {
    /// Type rank used as the first comparison key.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::Text(_) => 3,
            Value::Json(_) => 4,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Construct a finite number, rejecting NaN and infinity.
    pub fn number(n: f64) -> Option<Value> {
        n.is_finite().then_some(Value::Number(n))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            // Structured values order by their canonical serialization;
            // only equality actually matters for JSON columns.
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

// ── Row ────────────────────────────────────────────────────────────────────

/// An ordered column → value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    columns: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Row {
            columns: BTreeMap::new(),
        }
    }

    /// Builder-style insertion, for fixtures and literals.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// The value of `column`, treating absence as NULL.
    pub fn get_or_null(&self, column: &str) -> Value {
        self.columns.get(column).cloned().unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    /// Names of columns whose value differs between `self` and `other`,
    /// including columns present on only one side.
    pub fn changed_columns(&self, other: &Row) -> Vec<String> {
        let mut changed = Vec::new();
        for name in self.columns.keys().chain(other.columns.keys()) {
            if changed.iter().any(|c| c == name) {
                continue;
            }
            if self.get_or_null(name) != other.get_or_null(name) {
                changed.push(name.clone());
            }
        }
        changed
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Row {
            columns: iter.into_iter().collect(),
        }
    }
}
