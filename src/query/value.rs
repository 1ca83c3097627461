//! Document values and the annotated items that flow between operators.
//!
//! Values follow the document collation: MISSING < NULL < FALSE < TRUE <
//! numbers < strings < arrays < objects. Arrays compare element-wise and
//! objects compare by size, then by sorted key/value pairs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Type tag of a [`Value`], ordered by collation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    /// Absent field.
    Missing,
    /// JSON null.
    Null,
    /// Boolean.
    Boolean,
    /// Number.
    Number,
    /// String.
    String,
    /// Array.
    Array,
    /// Object.
    Object,
}

/// A document value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    /// Absent field; never stored, only produced by evaluation.
    #[default]
    Missing,
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Number (all numbers are 64-bit floats).
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list.
    Array(Vec<Value>),
    /// Object with sorted field names.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Type tag.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Missing => ValueType::Missing,
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Boolean,
            Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }

    /// Empty object.
    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// True for MISSING.
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// True for MISSING or NULL.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Value::Missing | Value::Null)
    }

    /// Truthiness used by filters: false, zero, empty strings and empty
    /// containers are false, as are MISSING and NULL.
    pub fn truth(&self) -> bool {
        match self {
            Value::Missing | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(fields) => !fields.is_empty(),
        }
    }

    /// Field lookup; MISSING for non-objects and absent names.
    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Object(fields) => fields.get(name).cloned().unwrap_or(Value::Missing),
            _ => Value::Missing,
        }
    }

    /// Borrowing field lookup.
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Sets a field, turning a non-object value into an object first.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        if !matches!(self, Value::Object(_)) {
            *self = Value::empty_object();
        }
        if let Value::Object(fields) = self {
            if value.is_missing() {
                fields.remove(&name.into());
            } else {
                fields.insert(name.into(), value);
            }
        }
    }

    /// String payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Array payload.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Total collation order.
    pub fn collate(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                if a == b {
                    Ordering::Equal
                } else {
                    a.total_cmp(b)
                }
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.collate(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                let ord = a.len().cmp(&b.len());
                if ord != Ordering::Equal {
                    return ord;
                }
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.collate(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
            _ => self.value_type().cmp(&other.value_type()),
        }
    }

    /// Converts to JSON; MISSING becomes null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Missing | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .filter(|(_, v)| !v.is_missing())
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.collate(other) == Ordering::Equal
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
        self.collate(other)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => f.write_str("missing"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Metadata attached to an item by the scan that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaAttachment {
    /// Alias of the keyspace term the document belongs to.
    pub alias: String,
    /// Document key.
    pub id: String,
}

/// An item flowing through the pipeline: a value plus attachments.
///
/// Items created by correlated scans carry the outer item as `parent`;
/// field and `META()` lookups fall back to the parent scope.
#[derive(Clone, Debug)]
pub struct AnnotatedValue {
    value: Value,
    meta: Option<MetaAttachment>,
    covers: BTreeMap<String, Value>,
    aggregates: BTreeMap<String, Value>,
    parent: Option<Arc<AnnotatedValue>>,
}

impl Default for AnnotatedValue {
    fn default() -> Self {
        Self::new(Value::empty_object())
    }
}

impl AnnotatedValue {
    /// Wraps a value without attachments.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            meta: None,
            covers: BTreeMap::new(),
            aggregates: BTreeMap::new(),
            parent: None,
        }
    }

    /// Empty item scoped under `parent`, if any.
    pub fn scoped(parent: Option<Arc<AnnotatedValue>>) -> Self {
        let mut item = Self::default();
        item.parent = parent;
        item
    }

    /// Underlying value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Replaces the underlying value, keeping attachments.
    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    /// Consumes the item and returns its value.
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Parent scope.
    pub fn parent(&self) -> Option<&Arc<AnnotatedValue>> {
        self.parent.as_ref()
    }

    /// Field lookup with fallback to the parent scope.
    pub fn field(&self, name: &str) -> Value {
        match self.value.get_field(name) {
            Some(v) if !v.is_missing() => v.clone(),
            _ => match &self.parent {
                Some(parent) => parent.field(name),
                None => Value::Missing,
            },
        }
    }

    /// Sets a top-level field on this item's own value.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.value.set_field(name, value);
    }

    /// Attaches `meta` for the producing keyspace alias.
    pub fn set_meta(&mut self, alias: impl Into<String>, id: impl Into<String>) {
        self.meta = Some(MetaAttachment {
            alias: alias.into(),
            id: id.into(),
        });
    }

    /// This item's own meta attachment.
    pub fn meta(&self) -> Option<&MetaAttachment> {
        self.meta.as_ref()
    }

    /// Document key of this item.
    pub fn meta_id(&self) -> Option<&str> {
        self.meta.as_ref().map(|m| m.id.as_str())
    }

    /// Meta attachment for `alias`, searching parent scopes.
    pub fn meta_for(&self, alias: &str) -> Option<&MetaAttachment> {
        match &self.meta {
            Some(meta) if meta.alias == alias => Some(meta),
            _ => self.parent.as_ref().and_then(|p| p.meta_for(alias)),
        }
    }

    /// Records an index-provided value for a covered expression.
    pub fn set_cover(&mut self, expr_text: impl Into<String>, value: Value) {
        self.covers.insert(expr_text.into(), value);
    }

    /// Covered value for an expression, if the scan provided one.
    pub fn cover(&self, expr_text: &str) -> Option<&Value> {
        self.covers.get(expr_text)
    }

    /// Stores an aggregate result.
    pub fn set_aggregate(&mut self, alias: impl Into<String>, value: Value) {
        self.aggregates.insert(alias.into(), value);
    }

    /// Aggregate result by alias.
    pub fn aggregate(&self, alias: &str) -> Option<&Value> {
        self.aggregates.get(alias)
    }

    /// JSON rendering used by the CLI: the value plus `meta`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("value".into(), self.value.to_json());
        if let Some(meta) = &self.meta {
            out.insert("meta".into(), serde_json::json!({ "id": meta.id }));
        }
        serde_json::Value::Object(out)
    }
}
