//! Replicated tablets keep their data as a replication log: every row
//! mutation becomes one log row appended to an ordered tablet.
//!
//! Log row layout for a sorted source table with `K` key columns:
//! ```text
//!  id 0          $row_index     null (assigned by the ordered store)
//!  id 1          $change_type   Int64: Write | Delete
//!  id 2..K+2     keys
//!  writes only, per value column i:
//!  id 2i+K+2     value          null when absent
//!  id 2i+K+3     flags          Uint64: MISSING unless written, AGGREGATE if aggregate
//! ```
//! For an ordered source table: `$row_index` then the values shifted by one.

use std::sync::Arc;

use tablet_common::bg_supervisor::BgActivitySupervisor;
use tablet_common::error::TabletResult;
use tablet_common::schema::{ColumnSchema, TableSchema};
use tablet_common::types::PartitionId;
use tablet_common::value::{ColumnId, UnversionedRow, UnversionedValue, Value, ValueType};

use crate::comparer::RowKey;
use crate::store::Store;
use crate::tablet::Tablet;

use super::{OrderedStoreManager, StoreManager, StoreManagerBase, WireCommand, WriteContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ChangeType {
    Write = 1,
    Delete = 2,
}

/// Per-value flags of a sorted log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogValueFlags(pub u64);

impl LogValueFlags {
    pub const NONE: LogValueFlags = LogValueFlags(0);
    pub const MISSING: LogValueFlags = LogValueFlags(0x01);
    pub const AGGREGATE: LogValueFlags = LogValueFlags(0x02);

    pub fn contains(self, other: LogValueFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Schema of the log a replicated tablet stores for `source`.
pub fn log_schema(source: &TableSchema) -> TabletResult<TableSchema> {
    let mut columns = vec![ColumnSchema::new("$row_index", ValueType::Int64)];
    if source.is_sorted() {
        columns.push(ColumnSchema::new("$change_type", ValueType::Int64));
        for key in &source.columns[..source.key_column_count] {
            columns.push(ColumnSchema::new(&format!("$key:{}", key.name), key.value_type));
        }
        for value in &source.columns[source.key_column_count..] {
            columns.push(ColumnSchema::new(&format!("$value:{}", value.name), value.value_type));
            columns.push(ColumnSchema::new(&format!("$flags:{}", value.name), ValueType::Uint64));
        }
    } else {
        for value in &source.columns {
            columns.push(ColumnSchema::new(&format!("$value:{}", value.name), value.value_type));
        }
    }
    TableSchema::new(columns, 0)
}

fn build_sorted_log_row(source: &TableSchema, change_type: ChangeType, keys: &[Value], row: Option<&UnversionedRow>) -> UnversionedRow {
    let key_count = source.key_column_count;
    let mut values = vec![
        UnversionedValue::null(0),
        UnversionedValue::new(1, change_type as i64),
    ];
    for (i, key) in keys.iter().take(key_count).enumerate() {
        values.push(UnversionedValue::new((i + 2) as ColumnId, key.clone()));
    }
    if change_type == ChangeType::Write {
        let value_count = source.value_column_count();
        let first = values.len();
        for i in 0..value_count {
            values.push(UnversionedValue::null((2 * i + key_count + 2) as ColumnId));
            values.push(UnversionedValue::new(
                (2 * i + key_count + 3) as ColumnId,
                LogValueFlags::MISSING.0,
            ));
        }
        for v in row.map(|r| r.values.as_slice()).unwrap_or(&[]) {
            let id = v.id as usize;
            if id < key_count || id >= source.column_count() {
                continue;
            }
            let slot = first + 2 * (id - key_count);
            values[slot].value = v.value.clone();
            let mut flags = LogValueFlags::NONE;
            if v.aggregate {
                flags = LogValueFlags(flags.0 | LogValueFlags::AGGREGATE.0);
            }
            values[slot + 1].value = Value::Uint64(flags.0);
        }
    }
    UnversionedRow::new(values)
}

fn build_ordered_log_row(row: &UnversionedRow) -> UnversionedRow {
    let mut values = vec![UnversionedValue::null(0)];
    values.extend(row.values.iter().map(|v| UnversionedValue {
        id: v.id + 1,
        value: v.value.clone(),
        aggregate: v.aggregate,
    }));
    UnversionedRow::new(values)
}

/// Log row for one command against a table with schema `source`.
///
/// # Panics
/// On commands a replication log cannot express (versioned rows, deletes of
/// ordered rows).
pub fn build_log_row(source: &TableSchema, command: &WireCommand) -> UnversionedRow {
    match (source.is_sorted(), command) {
        (true, WireCommand::WriteRow(row)) | (true, WireCommand::ReadLockWriteRow { row, .. }) => {
            build_sorted_log_row(source, ChangeType::Write, &row.key(source.key_column_count), Some(row))
        }
        (true, WireCommand::DeleteRow(keys)) => build_sorted_log_row(source, ChangeType::Delete, keys, None),
        (false, WireCommand::WriteRow(row)) => build_ordered_log_row(row),
        (_, other) => panic!("{:?} cannot be written to a replication log", other),
    }
}

/// Store manager of a replicated tablet: an ordered store manager holding
/// the log, fed with log rows built from the source table's mutations.
pub struct ReplicatedStoreManager {
    source_schema: Arc<TableSchema>,
    log: OrderedStoreManager,
}

impl ReplicatedStoreManager {
    /// `tablet` must carry [`log_schema`] of `source_schema`.
    pub fn new(source_schema: Arc<TableSchema>, tablet: Tablet, supervisor: Arc<BgActivitySupervisor>) -> Self {
        Self {
            source_schema,
            log: OrderedStoreManager::new(tablet, supervisor),
        }
    }

    pub fn source_schema(&self) -> &Arc<TableSchema> {
        &self.source_schema
    }
}

impl StoreManager for ReplicatedStoreManager {
    fn base(&self) -> &StoreManagerBase {
        self.log.base()
    }

    fn base_mut(&mut self) -> &mut StoreManagerBase {
        self.log.base_mut()
    }

    fn create_active_store(&mut self) -> TabletResult<Store> {
        self.log.create_active_store()
    }

    fn execute_writes(&mut self, commands: &[WireCommand], ctx: &mut WriteContext) -> TabletResult<()> {
        let log_rows: Vec<WireCommand> = commands
            .iter()
            .map(|c| WireCommand::WriteRow(build_log_row(&self.source_schema, c)))
            .collect();
        self.log.execute_writes(&log_rows, ctx)
    }

    fn split_partition(&mut self, _index: usize, _pivot_keys: Vec<RowKey>) -> TabletResult<Vec<PartitionId>> {
        panic!("partition split is not supported for replicated tablet {}", self.tablet().id())
    }

    fn merge_partitions(&mut self, _first: usize, _last: usize) -> TabletResult<PartitionId> {
        panic!("partition merge is not supported for replicated tablet {}", self.tablet().id())
    }

    fn update_partition_sample_keys(&mut self, _id: PartitionId, _sample_keys: Vec<RowKey>) -> TabletResult<()> {
        panic!("sample key update is not supported for replicated tablet {}", self.tablet().id())
    }

    fn bulk_add_stores(&mut self, _stores: Vec<Store>) -> TabletResult<()> {
        panic!("bulk insert is not supported for replicated tablet {}", self.tablet().id())
    }

    fn discard_all_stores(&mut self) -> TabletResult<()> {
        panic!("discarding stores is not supported for replicated tablet {}", self.tablet().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::config::TabletManagerConfig;
    use tablet_common::types::{TabletId, Timestamp, TxnId};

    fn sorted_source() -> TableSchema {
        TableSchema::sorted(
            &[ValueType::Int64, ValueType::String],
            &[ValueType::Int64, ValueType::Double],
        )
    }

    fn manager(source: TableSchema) -> ReplicatedStoreManager {
        let tablet = Tablet::new(
            TabletId(3),
            Arc::new(log_schema(&source).unwrap()),
            Arc::new(TabletManagerConfig::default()),
        );
        let mut m = ReplicatedStoreManager::new(Arc::new(source), tablet, Arc::new(BgActivitySupervisor::new()));
        m.mount().unwrap();
        m
    }

    #[test]
    fn test_sorted_write_log_row_layout() {
        let source = sorted_source();
        let row = UnversionedRow::new(vec![
            UnversionedValue::new(0, 7i64),
            UnversionedValue::new(1, "k"),
            UnversionedValue::aggregate(3, 1.5f64),
        ]);
        let log = build_log_row(&source, &WireCommand::WriteRow(row));
        let ids: Vec<ColumnId> = log.values.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(log.values[0].value, Value::Null);
        assert_eq!(log.values[1].value, Value::Int64(1));
        assert_eq!(log.values[2].value, Value::Int64(7));
        assert_eq!(log.values[3].value, Value::String("k".into()));
        // value column 2 was not written
        assert_eq!(log.values[4].value, Value::Null);
        assert_eq!(log.values[5].value, Value::Uint64(LogValueFlags::MISSING.0));
        // value column 3 was written as an aggregate
        assert_eq!(log.values[6].value, Value::Double(1.5));
        assert_eq!(log.values[7].value, Value::Uint64(LogValueFlags::AGGREGATE.0));
    }

    #[test]
    fn test_present_value_clears_missing() {
        let source = sorted_source();
        let row = UnversionedRow::new(vec![
            UnversionedValue::new(0, 1i64),
            UnversionedValue::new(1, "a"),
            UnversionedValue::new(2, 5i64),
        ]);
        let log = build_log_row(&source, &WireCommand::WriteRow(row));
        assert_eq!(log.values[4].value, Value::Int64(5));
        assert_eq!(log.values[5].value, Value::Uint64(0));
    }

    #[test]
    fn test_delete_log_row_has_keys_only() {
        let source = sorted_source();
        let log = build_log_row(
            &source,
            &WireCommand::DeleteRow(vec![Value::Int64(1), Value::String("a".into())]),
        );
        assert_eq!(log.values.len(), 4);
        assert_eq!(log.values[1].value, Value::Int64(2));
        assert_eq!(log.values[3].id, 3);
    }

    #[test]
    fn test_ordered_log_row_shifts_ids() {
        let source = TableSchema::ordered(&[ValueType::Int64, ValueType::Int64]);
        let log = build_log_row(&source, &WireCommand::WriteRow(UnversionedRow::from_values(vec![Value::Int64(4), Value::Int64(5)])));
        let ids: Vec<ColumnId> = log.values.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(log_schema(&source).unwrap().column_count(), 3);
    }

    #[test]
    fn test_log_rows_appended_at_commit() {
        let mut m = manager(sorted_source());
        let mut ctx = WriteContext::at_commit(TxnId(1), Timestamp(1), Timestamp(0x30));
        m.execute_writes(
            &[
                WireCommand::WriteRow(UnversionedRow::new(vec![
                    UnversionedValue::new(0, 1i64),
                    UnversionedValue::new(1, "a"),
                ])),
                WireCommand::DeleteRow(vec![Value::Int64(1), Value::String("a".into())]),
            ],
            &mut ctx,
        )
        .unwrap();
        let store = m.tablet().active_store().unwrap().as_ordered_dynamic().unwrap().clone();
        let rows = store.get_all_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].timestamp, Timestamp(0x30));
        assert_eq!(rows[1].row.values[1].value, Value::Int64(2));
    }

    #[test]
    #[should_panic(expected = "partition split is not supported")]
    fn test_split_partition_aborts() {
        let mut m = manager(sorted_source());
        let _ = m.split_partition(0, Vec::new());
    }

    #[test]
    #[should_panic(expected = "bulk insert is not supported")]
    fn test_bulk_add_aborts() {
        let mut m = manager(sorted_source());
        let _ = m.bulk_add_stores(Vec::new());
    }
}
