use serde::{Deserialize, Serialize};

use crate::error::{TabletError, TabletResult};
use crate::value::{ColumnId, ValueType};

/// Index of the lock guarding columns that name no explicit lock group.
pub const PRIMARY_LOCK_INDEX: usize = 0;

/// Lock descriptors a row can carry, primary lock included.
pub const MAX_LOCK_COUNT: usize = 32;

/// Column definition in a tablet schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub value_type: ValueType,
    /// Columns sharing a lock group are serialized through one lock descriptor.
    /// Key columns never carry one.
    #[serde(default)]
    pub lock_group: Option<String>,
    /// Name of the aggregate function merging `aggregate` writes, if any.
    #[serde(default)]
    pub aggregate: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            value_type,
            lock_group: None,
            aggregate: None,
        }
    }

    pub fn with_lock_group(mut self, group: &str) -> Self {
        self.lock_group = Some(group.to_string());
        self
    }

    pub fn with_aggregate(mut self, function: &str) -> Self {
        self.aggregate = Some(function.to_string());
        self
    }
}

/// Tablet schema metadata.
///
/// Key columns come first. A schema with no key columns describes an ordered
/// (log-structured) table whose rows are addressed by row index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TableSchemaDef")]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
    pub key_column_count: usize,
    /// Lock index per column; key columns map to the primary lock.
    #[serde(skip)]
    column_lock_indexes: Vec<usize>,
    #[serde(skip)]
    lock_count: usize,
}

#[derive(Deserialize)]
struct TableSchemaDef {
    columns: Vec<ColumnSchema>,
    key_column_count: usize,
}

impl TryFrom<TableSchemaDef> for TableSchema {
    type Error = TabletError;

    fn try_from(def: TableSchemaDef) -> TabletResult<Self> {
        TableSchema::new(def.columns, def.key_column_count)
    }
}

impl TableSchema {
    /// Fails when the columns name more lock groups than a row can carry.
    pub fn new(columns: Vec<ColumnSchema>, key_column_count: usize) -> TabletResult<Self> {
        if key_column_count > columns.len() {
            return Err(TabletError::InvalidSchema(format!(
                "{} key columns in a schema of {} columns",
                key_column_count,
                columns.len()
            )));
        }
        let schema = Self::build(columns, key_column_count);
        if schema.lock_count > MAX_LOCK_COUNT {
            return Err(TabletError::InvalidSchema(format!(
                "{} locks requested, at most {} are supported",
                schema.lock_count, MAX_LOCK_COUNT
            )));
        }
        Ok(schema)
    }

    fn build(columns: Vec<ColumnSchema>, key_column_count: usize) -> Self {
        let mut schema = Self {
            columns,
            key_column_count,
            column_lock_indexes: Vec::new(),
            lock_count: 0,
        };
        schema.rebuild_lock_groups();
        schema
    }

    /// Schema with `key_types.len()` key columns named `k0..` and value columns `v0..`.
    pub fn sorted(key_types: &[ValueType], value_types: &[ValueType]) -> Self {
        let mut columns = Vec::with_capacity(key_types.len() + value_types.len());
        for (i, t) in key_types.iter().enumerate() {
            columns.push(ColumnSchema::new(&format!("k{}", i), *t));
        }
        for (i, t) in value_types.iter().enumerate() {
            columns.push(ColumnSchema::new(&format!("v{}", i), *t));
        }
        // a single primary lock
        Self::build(columns, key_types.len())
    }

    pub fn ordered(value_types: &[ValueType]) -> Self {
        Self::sorted(&[], value_types)
    }

    fn rebuild_lock_groups(&mut self) {
        let mut groups: Vec<&str> = Vec::new();
        let mut indexes = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let index = match (&column.lock_group, i < self.key_column_count) {
                (Some(group), false) => {
                    match groups.iter().position(|g| *g == group.as_str()) {
                        Some(pos) => pos + 1,
                        None => {
                            groups.push(group.as_str());
                            groups.len()
                        }
                    }
                }
                _ => PRIMARY_LOCK_INDEX,
            };
            indexes.push(index);
        }
        self.lock_count = groups.len() + 1;
        self.column_lock_indexes = indexes;
    }

    pub fn is_sorted(&self) -> bool {
        self.key_column_count > 0
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn value_column_count(&self) -> usize {
        self.columns.len() - self.key_column_count
    }

    /// Number of lock descriptors each row carries (primary lock included).
    pub fn lock_count(&self) -> usize {
        self.lock_count
    }

    pub fn column_lock_index(&self, id: ColumnId) -> usize {
        self.column_lock_indexes
            .get(id as usize)
            .copied()
            .unwrap_or(PRIMARY_LOCK_INDEX)
    }

    pub fn is_key_column(&self, id: ColumnId) -> bool {
        (id as usize) < self.key_column_count
    }

    pub fn column(&self, id: ColumnId) -> Option<&ColumnSchema> {
        self.columns.get(id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_groups() {
        let schema = TableSchema::new(
            vec![
                ColumnSchema::new("k", ValueType::Int64),
                ColumnSchema::new("a", ValueType::Int64).with_lock_group("l1"),
                ColumnSchema::new("b", ValueType::Int64),
                ColumnSchema::new("c", ValueType::String).with_lock_group("l2"),
                ColumnSchema::new("d", ValueType::Int64).with_lock_group("l1"),
            ],
            1,
        )
        .unwrap();
        assert_eq!(schema.lock_count(), 3);
        assert_eq!(schema.column_lock_index(0), PRIMARY_LOCK_INDEX);
        assert_eq!(schema.column_lock_index(1), 1);
        assert_eq!(schema.column_lock_index(2), PRIMARY_LOCK_INDEX);
        assert_eq!(schema.column_lock_index(3), 2);
        assert_eq!(schema.column_lock_index(4), 1);
    }

    #[test]
    fn test_sorted_and_ordered() {
        let sorted = TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]);
        assert!(sorted.is_sorted());
        assert_eq!(sorted.value_column_count(), 1);
        assert_eq!(sorted.lock_count(), 1);

        let ordered = TableSchema::ordered(&[ValueType::String, ValueType::Int64]);
        assert!(!ordered.is_sorted());
        assert_eq!(ordered.column_count(), 2);
    }

    #[test]
    fn test_deserialize_rebuilds_lock_groups() {
        let schema = TableSchema::new(
            vec![
                ColumnSchema::new("k", ValueType::Int64),
                ColumnSchema::new("a", ValueType::Int64).with_lock_group("l1"),
            ],
            1,
        )
        .unwrap();
        let json = serde_json::to_string(&schema).unwrap();
        let back: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lock_count(), 2);
        assert_eq!(back, schema);
    }

    fn grouped_columns(groups: usize) -> Vec<ColumnSchema> {
        let mut columns = vec![ColumnSchema::new("k", ValueType::Int64)];
        for i in 0..groups {
            columns.push(ColumnSchema::new(&format!("c{}", i), ValueType::Int64).with_lock_group(&format!("g{}", i)));
        }
        columns
    }

    #[test]
    fn test_lock_count_is_capped() {
        let widest = TableSchema::new(grouped_columns(MAX_LOCK_COUNT - 1), 1).unwrap();
        assert_eq!(widest.lock_count(), MAX_LOCK_COUNT);

        let err = TableSchema::new(grouped_columns(MAX_LOCK_COUNT), 1).unwrap_err();
        assert!(matches!(err, TabletError::InvalidSchema(_)));
        assert!(err.to_string().contains("33 locks requested"));
    }

    #[test]
    fn test_deserialize_rejects_too_many_locks() {
        let json = serde_json::json!({
            "columns": grouped_columns(MAX_LOCK_COUNT),
            "key_column_count": 1,
        });
        assert!(serde_json::from_value::<TableSchema>(json).is_err());
        assert!(TableSchema::new(grouped_columns(0), 2).is_err());
    }
}
