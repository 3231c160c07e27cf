use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Timestamp;

/// Column id inside a row. Ids are positional within the table schema.
pub type ColumnId = u16;

/// Physical value types a tablet column can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int64,
    Uint64,
    Double,
    Boolean,
    String,
}

/// A single scalar cell. `Null` sorts before every other value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Int64(_) => Some(ValueType::Int64),
            Value::Uint64(_) => Some(ValueType::Uint64),
            Value::Double(_) => Some(ValueType::Double),
            Value::Boolean(_) => Some(ValueType::Boolean),
            Value::String(_) => Some(ValueType::String),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Rough in-memory footprint, used for pool size accounting.
    pub fn byte_size(&self) -> usize {
        match self {
            Value::String(s) => 8 + s.len(),
            _ => 8,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "#"),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Uint64(v) => write!(f, "{}u", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// A cell tagged with its column id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnversionedValue {
    pub id: ColumnId,
    pub value: Value,
    /// Set when the value should be merged into the existing one by the
    /// column's aggregate function instead of overwriting it.
    pub aggregate: bool,
}

impl UnversionedValue {
    pub fn new(id: ColumnId, value: impl Into<Value>) -> Self {
        Self {
            id,
            value: value.into(),
            aggregate: false,
        }
    }

    pub fn null(id: ColumnId) -> Self {
        Self {
            id,
            value: Value::Null,
            aggregate: false,
        }
    }

    pub fn aggregate(id: ColumnId, value: impl Into<Value>) -> Self {
        Self {
            id,
            value: value.into(),
            aggregate: true,
        }
    }
}

/// A row without version information: keys first, then any subset of value columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnversionedRow {
    pub values: Vec<UnversionedValue>,
}

impl UnversionedRow {
    pub fn new(values: Vec<UnversionedValue>) -> Self {
        Self { values }
    }

    /// Builds a row from positional values; value `i` gets column id `i`.
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            values: values
                .into_iter()
                .enumerate()
                .map(|(i, value)| UnversionedValue {
                    id: i as ColumnId,
                    value,
                    aggregate: false,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: ColumnId) -> Option<&UnversionedValue> {
        self.values.iter().find(|v| v.id == id)
    }

    /// Key prefix of the row, in key column order.
    pub fn key(&self, key_column_count: usize) -> Vec<Value> {
        let mut key = vec![Value::Null; key_column_count];
        for v in &self.values {
            let id = v.id as usize;
            if id < key_column_count {
                key[id] = v.value.clone();
            }
        }
        key
    }
}

impl fmt::Display for UnversionedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", v.id, v.value)?;
        }
        write!(f, "]")
    }
}

/// A value cell carrying the timestamp it was committed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub id: ColumnId,
    pub value: Value,
    pub timestamp: Timestamp,
    pub aggregate: bool,
}

impl VersionedValue {
    pub fn new(id: ColumnId, value: impl Into<Value>, timestamp: Timestamp) -> Self {
        Self {
            id,
            value: value.into(),
            timestamp,
            aggregate: false,
        }
    }
}

/// A row with its full (or partial) history.
///
/// Canonical form: values sorted by column id ascending then timestamp
/// descending; write and delete timestamps sorted descending without
/// duplicates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VersionedRow {
    pub keys: Vec<Value>,
    pub values: Vec<VersionedValue>,
    pub write_timestamps: Vec<Timestamp>,
    pub delete_timestamps: Vec<Timestamp>,
}

impl VersionedRow {
    /// Builds a row whose write timestamps are derived from its values.
    pub fn from_values(keys: Vec<Value>, values: Vec<VersionedValue>) -> Self {
        let write_timestamps = values.iter().map(|v| v.timestamp).collect();
        let mut row = Self {
            keys,
            values,
            write_timestamps,
            delete_timestamps: Vec::new(),
        };
        row.normalize();
        row
    }

    pub fn normalize(&mut self) {
        self.values
            .sort_by(|a, b| a.id.cmp(&b.id).then(b.timestamp.cmp(&a.timestamp)));
        self.values
            .dedup_by(|a, b| a.id == b.id && a.timestamp == b.timestamp);
        self.write_timestamps.sort_by(|a, b| b.cmp(a));
        self.write_timestamps.dedup();
        self.delete_timestamps.sort_by(|a, b| b.cmp(a));
        self.delete_timestamps.dedup();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.write_timestamps.is_empty() && self.delete_timestamps.is_empty()
    }

    pub fn latest_write_timestamp(&self) -> Option<Timestamp> {
        self.write_timestamps.first().copied()
    }

    pub fn latest_delete_timestamp(&self) -> Option<Timestamp> {
        self.delete_timestamps.first().copied()
    }

    /// Oldest and newest timestamp carried by the row.
    pub fn timestamp_range(&self) -> Option<(Timestamp, Timestamp)> {
        self.values
            .iter()
            .map(|v| v.timestamp)
            .chain(self.write_timestamps.iter().copied())
            .chain(self.delete_timestamps.iter().copied())
            .fold(None, |range, ts| match range {
                None => Some((ts, ts)),
                Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
            })
    }
}

impl fmt::Display for VersionedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, k) in self.keys.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", k)?;
        }
        write!(f, " |")?;
        for v in &self.values {
            write!(f, " {}@{:#x}={}", v.id, v.timestamp.0, v.value)?;
        }
        write!(f, " | w:{:?} d:{:?}]", self.write_timestamps, self.delete_timestamps)
    }
}
