//! Total order over values and keys.
//!
//! Every structure that must agree on row identity (the dynamic store index,
//! partition pivots, store boundaries, the merging readers) compares keys
//! through this module. Values of different types order by type rank
//! (`Null < Int64 < Uint64 < Double < Boolean < String`), doubles by
//! `total_cmp`, and a key that is a strict prefix of another sorts first.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use tablet_common::value::{UnversionedRow, Value};

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Int64(_) => 1,
        Value::Uint64(_) => 2,
        Value::Double(_) => 3,
        Value::Boolean(_) => 4,
        Value::String(_) => 5,
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::Uint64(x), Value::Uint64(y)) => x.cmp(y),
        (Value::Double(x), Value::Double(y)) => x.total_cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

pub fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Compares the key prefixes of two rows.
pub fn compare_rows(a: &UnversionedRow, b: &UnversionedRow, key_column_count: usize) -> Ordering {
    compare_keys(&a.key(key_column_count), &b.key(key_column_count))
}

/// Owned key used as the identity of a sorted row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowKey(pub Vec<Value>);

impl RowKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Bit `i` is set when key column `i` is null.
    pub fn null_mask(&self) -> u64 {
        self.0
            .iter()
            .take(64)
            .enumerate()
            .filter(|(_, v)| v.is_null())
            .fold(0u64, |mask, (i, _)| mask | (1u64 << i))
    }
}

impl From<Vec<Value>> for RowKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        compare_keys(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for RowKey {}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.0, &other.0)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

/// A key extended with the two infinities, used for range bounds, partition
/// pivots and store boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyBound {
    Min,
    Key(RowKey),
    Max,
}

impl KeyBound {
    pub fn key(values: Vec<Value>) -> Self {
        KeyBound::Key(RowKey(values))
    }

    pub fn as_key(&self) -> Option<&RowKey> {
        match self {
            KeyBound::Key(k) => Some(k),
            _ => None,
        }
    }

    pub fn cmp_key(&self, key: &RowKey) -> Ordering {
        match self {
            KeyBound::Min => Ordering::Less,
            KeyBound::Key(k) => k.cmp(key),
            KeyBound::Max => Ordering::Greater,
        }
    }
}

impl From<RowKey> for KeyBound {
    fn from(key: RowKey) -> Self {
        KeyBound::Key(key)
    }
}

impl PartialOrd for KeyBound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyBound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyBound::Min, KeyBound::Min) | (KeyBound::Max, KeyBound::Max) => Ordering::Equal,
            (KeyBound::Min, _) | (_, KeyBound::Max) => Ordering::Less,
            (_, KeyBound::Min) | (KeyBound::Max, _) => Ordering::Greater,
            (KeyBound::Key(a), KeyBound::Key(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBound::Min => write!(f, "<min>"),
            KeyBound::Key(k) => write!(f, "{}", k),
            KeyBound::Max => write!(f, "<max>"),
        }
    }
}
