//! Row mergers: combine the partial histories one key has in several stores.
//!
//! - [`SchemafulRowMerger`] produces the row as of a read timestamp.
//! - [`VersionedRowMerger`] produces the merged history, optionally dropping
//!   versions that no reader at or after the major timestamp can observe.

use std::sync::Arc;

use tablet_common::schema::TableSchema;
use tablet_common::types::Timestamp;
use tablet_common::value::{ColumnId, UnversionedRow, UnversionedValue, Value, VersionedRow, VersionedValue};

/// Merges the rows all stores hold for one key.
pub trait RowMerger {
    type Output;

    /// `rows` are non-empty and share one key.
    fn merge(&mut self, rows: Vec<VersionedRow>) -> Option<Self::Output>;
}

fn concat_history(rows: Vec<VersionedRow>) -> VersionedRow {
    let mut iter = rows.into_iter();
    let mut merged = iter.next().unwrap_or_default();
    for row in iter {
        merged.values.extend(row.values);
        merged.write_timestamps.extend(row.write_timestamps);
        merged.delete_timestamps.extend(row.delete_timestamps);
    }
    merged.normalize();
    merged
}

/// Folds aggregate deltas with the column's aggregate function.
fn fold_aggregate(function: &str, acc: Value, next: &Value) -> Value {
    match (function, &acc, next) {
        (_, Value::Null, v) => v.clone(),
        (_, _, Value::Null) => acc,
        ("sum", Value::Int64(a), Value::Int64(b)) => Value::Int64(a.wrapping_add(*b)),
        ("sum", Value::Uint64(a), Value::Uint64(b)) => Value::Uint64(a.wrapping_add(*b)),
        ("sum", Value::Double(a), Value::Double(b)) => Value::Double(a + b),
        ("min", a, b) => {
            if crate::comparer::compare_values(b, a).is_lt() {
                b.clone()
            } else {
                acc
            }
        }
        ("max", a, b) => {
            if crate::comparer::compare_values(b, a).is_gt() {
                b.clone()
            } else {
                acc
            }
        }
        _ => next.clone(),
    }
}

/// Produces the latest visible version of a row: key columns, then the
/// requested value columns (all of them when no filter is given).
pub struct SchemafulRowMerger {
    schema: Arc<TableSchema>,
    timestamp: Timestamp,
    value_columns: Vec<ColumnId>,
}

impl SchemafulRowMerger {
    pub fn new(schema: Arc<TableSchema>, timestamp: Timestamp, column_filter: Option<&[ColumnId]>) -> Self {
        let key_count = schema.key_column_count;
        let value_columns = match column_filter {
            Some(filter) => filter
                .iter()
                .copied()
                .filter(|id| (*id as usize) >= key_count && (*id as usize) < schema.column_count())
                .collect(),
            None => (key_count..schema.column_count()).map(|i| i as ColumnId).collect(),
        };
        Self {
            schema,
            timestamp,
            value_columns,
        }
    }

    fn column_value(&self, row: &VersionedRow, id: ColumnId, after: Timestamp) -> Value {
        // values are ordered by id, then newest first
        let versions = row
            .values
            .iter()
            .filter(|v| v.id == id && v.timestamp > after && v.timestamp <= self.timestamp);
        let aggregate = self.schema.column(id).and_then(|c| c.aggregate.clone());
        match aggregate {
            None => versions.map(|v| v.value.clone()).next().unwrap_or(Value::Null),
            Some(function) => {
                let mut chain: Vec<&VersionedValue> = Vec::new();
                for v in versions {
                    chain.push(v);
                    if !v.aggregate {
                        break;
                    }
                }
                chain
                    .iter()
                    .rev()
                    .fold(Value::Null, |acc, v| fold_aggregate(&function, acc, &v.value))
            }
        }
    }
}

impl RowMerger for SchemafulRowMerger {
    type Output = UnversionedRow;

    fn merge(&mut self, rows: Vec<VersionedRow>) -> Option<UnversionedRow> {
        let row = concat_history(rows);
        let latest_write = row
            .write_timestamps
            .iter()
            .copied()
            .find(|ts| *ts <= self.timestamp)?;
        let latest_delete = row
            .delete_timestamps
            .iter()
            .copied()
            .find(|ts| *ts <= self.timestamp)
            .unwrap_or(Timestamp::NULL);
        if latest_delete >= latest_write {
            return None;
        }
        let mut values: Vec<UnversionedValue> = row
            .keys
            .iter()
            .enumerate()
            .map(|(i, v)| UnversionedValue::new(i as ColumnId, v.clone()))
            .collect();
        for id in &self.value_columns {
            values.push(UnversionedValue::new(*id, self.column_value(&row, *id, latest_delete)));
        }
        Some(UnversionedRow::new(values))
    }
}

/// Produces full histories cut at `current_timestamp`.
///
/// With a major timestamp other than `NULL`, each column keeps every version
/// newer than it plus the newest version at or below it, unless a delete at
/// or below the major timestamp supersedes that version. Deletes at or below
/// the major timestamp are dropped. Aggregate columns keep their whole chain
/// since the last such delete.
pub struct VersionedRowMerger {
    schema: Arc<TableSchema>,
    current_timestamp: Timestamp,
    major_timestamp: Timestamp,
    column_filter: Option<Vec<ColumnId>>,
}

impl VersionedRowMerger {
    pub fn new(
        schema: Arc<TableSchema>,
        current_timestamp: Timestamp,
        major_timestamp: Timestamp,
        column_filter: Option<Vec<ColumnId>>,
    ) -> Self {
        Self {
            schema,
            current_timestamp,
            major_timestamp,
            column_filter,
        }
    }

    fn collect_garbage(&self, row: VersionedRow) -> VersionedRow {
        let major = self.major_timestamp;
        let gc_delete = row
            .delete_timestamps
            .iter()
            .copied()
            .find(|ts| *ts <= major)
            .unwrap_or(Timestamp::NULL);

        let keep = |timestamps: &[Timestamp]| -> Vec<Timestamp> {
            let mut out: Vec<Timestamp> = timestamps.iter().copied().filter(|ts| *ts > major).collect();
            if let Some(base) = timestamps.iter().copied().find(|ts| *ts <= major) {
                if base > gc_delete {
                    out.push(base);
                }
            }
            out
        };

        let write_timestamps = keep(&row.write_timestamps);
        let mut values = Vec::with_capacity(row.values.len());
        let mut i = 0;
        while i < row.values.len() {
            let id = row.values[i].id;
            let mut j = i;
            while j < row.values.len() && row.values[j].id == id {
                j += 1;
            }
            let column = &row.values[i..j];
            let is_aggregate = self
                .schema
                .column(id)
                .map(|c| c.aggregate.is_some())
                .unwrap_or(false);
            for (n, v) in column.iter().enumerate() {
                let newest_below_major = v.timestamp <= major
                    && column[..n].iter().all(|newer| newer.timestamp > major);
                let retained = v.timestamp > major
                    || (v.timestamp > gc_delete && (newest_below_major || is_aggregate));
                if retained {
                    values.push(v.clone());
                }
            }
            i = j;
        }
        VersionedRow {
            keys: row.keys,
            values,
            write_timestamps,
            delete_timestamps: row
                .delete_timestamps
                .into_iter()
                .filter(|ts| *ts > major)
                .collect(),
        }
    }
}

impl RowMerger for VersionedRowMerger {
    type Output = VersionedRow;

    fn merge(&mut self, rows: Vec<VersionedRow>) -> Option<VersionedRow> {
        let mut row = concat_history(rows);
        let current = self.current_timestamp;
        row.values.retain(|v| v.timestamp <= current);
        if let Some(filter) = &self.column_filter {
            row.values.retain(|v| filter.contains(&v.id));
        }
        row.write_timestamps.retain(|ts| *ts <= current);
        row.delete_timestamps.retain(|ts| *ts <= current);
        if self.major_timestamp != Timestamp::NULL {
            row = self.collect_garbage(row);
        }
        if row.write_timestamps.is_empty() && row.delete_timestamps.is_empty() {
            None
        } else {
            Some(row)
        }
    }
}
