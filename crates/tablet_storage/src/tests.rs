#[cfg(test)]
mod write_path_tests {
    use std::sync::Arc;

    use tablet_common::bg_supervisor::BgActivitySupervisor;
    use tablet_common::config::{BackoffConfig, TabletManagerConfig};
    use tablet_common::error::TabletError;
    use tablet_common::schema::{ColumnSchema, TableSchema};
    use tablet_common::types::{TabletId, Timestamp, TxnId};
    use tablet_common::value::{UnversionedRow, UnversionedValue, Value, ValueType};

    use crate::comparer::{KeyBound, RowKey};
    use crate::reader::{create_schemaful_tablet_reader, lookup_rows};
    use crate::store_manager::{SortedStoreManager, StoreManager, WireCommand, WriteContext};
    use crate::tablet::Tablet;

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSchema::new("k", ValueType::Int64),
                ColumnSchema::new("a", ValueType::Int64),
                ColumnSchema::new("b", ValueType::Int64).with_lock_group("l1"),
            ],
            1,
        )
        .unwrap()
    }

    fn manager() -> SortedStoreManager {
        let config = TabletManagerConfig {
            backoff: BackoffConfig::immediate(),
            ..TabletManagerConfig::default()
        };
        let tablet = Tablet::new(TabletId(1), Arc::new(schema()), Arc::new(config));
        let mut m = SortedStoreManager::new(tablet, Arc::new(BgActivitySupervisor::new()));
        m.mount().unwrap();
        m
    }

    fn write_a(k: i64, a: i64) -> WireCommand {
        WireCommand::WriteRow(UnversionedRow::new(vec![
            UnversionedValue::new(0, k),
            UnversionedValue::new(1, a),
        ]))
    }

    fn write_b(k: i64, b: i64) -> WireCommand {
        WireCommand::WriteRow(UnversionedRow::new(vec![
            UnversionedValue::new(0, k),
            UnversionedValue::new(2, b),
        ]))
    }

    fn commit(m: &mut SortedStoreManager, txn: u64, start_ts: u64, commit_ts: u64, commands: &[WireCommand]) {
        let mut ctx = WriteContext::new(TxnId(txn), Timestamp(start_ts));
        m.execute_writes(commands, &mut ctx).unwrap();
        for row in &ctx.locked_rows {
            m.prepare_row(row, TxnId(txn), Timestamp(commit_ts - 1));
        }
        for row in &ctx.locked_rows {
            m.commit_row(row, TxnId(txn), Timestamp(commit_ts)).unwrap();
        }
    }

    fn read_all(m: &SortedStoreManager, ts: u64) -> Vec<Vec<Value>> {
        create_schemaful_tablet_reader(&m.tablet().snapshot(), KeyBound::Min, KeyBound::Max, Timestamp(ts), None)
            .unwrap()
            .map(|r| r.values.into_iter().map(|v| v.value).collect())
            .collect()
    }

    #[test]
    fn test_disjoint_lock_groups_do_not_conflict() {
        let mut m = manager();
        let mut ctx1 = WriteContext::new(TxnId(1), Timestamp(10));
        m.execute_writes(&[write_a(1, 100)], &mut ctx1).unwrap();
        let mut ctx2 = WriteContext::new(TxnId(2), Timestamp(10));
        m.execute_writes(&[write_b(1, 200)], &mut ctx2).unwrap();

        let mut ctx3 = WriteContext::new(TxnId(3), Timestamp(10));
        let err = m.execute_writes(&[write_a(1, 300)], &mut ctx3).unwrap_err();
        assert!(err.is_lock_conflict());
        assert!(err.to_string().contains("Row lock conflict due to concurrent write"));

        for (ctx, ts) in [(&ctx1, 20u64), (&ctx2, 21)] {
            for row in &ctx.locked_rows {
                m.commit_row(row, ctx.txn_id, Timestamp(ts)).unwrap();
            }
        }
        let rows = read_all(&m, 30);
        assert_eq!(rows, vec![vec![Value::Int64(1), Value::Int64(100), Value::Int64(200)]]);
    }

    #[test]
    fn test_write_after_newer_commit_conflicts() {
        let mut m = manager();
        commit(&mut m, 1, 10, 20, &[write_a(1, 1)]);
        let mut ctx = WriteContext::new(TxnId(2), Timestamp(15));
        let err = m.execute_writes(&[write_a(1, 2)], &mut ctx).unwrap_err();
        assert!(matches!(err, TabletError::LockConflict { .. }));
        assert!(ctx.locked_rows.is_empty());
        // other lock group committed nothing after 15
        m.execute_writes(&[write_b(1, 3)], &mut ctx).unwrap();
    }

    #[test]
    fn test_delete_then_rewrite_visibility() {
        let mut m = manager();
        commit(&mut m, 1, 1, 10, &[write_a(1, 1), write_a(2, 2)]);
        commit(&mut m, 2, 11, 20, &[WireCommand::DeleteRow(vec![Value::Int64(1)])]);
        commit(&mut m, 3, 21, 30, &[write_b(1, 7)]);

        assert_eq!(read_all(&m, 15).len(), 2);
        assert_eq!(read_all(&m, 25), vec![vec![Value::Int64(2), Value::Int64(2), Value::Null]]);
        let rows = lookup_rows(&m.tablet().snapshot(), &[RowKey(vec![Value::Int64(1)])], Timestamp(35), None).unwrap();
        // the value written before the delete stays hidden
        assert_eq!(
            rows[0].as_ref().unwrap().values.iter().map(|v| v.value.clone()).collect::<Vec<_>>(),
            vec![Value::Int64(1), Value::Null, Value::Int64(7)]
        );
    }

    #[test]
    fn test_rows_survive_rotation_and_flush() {
        let mut m = manager();
        commit(&mut m, 1, 1, 10, &[write_a(1, 1)]);
        let first = m.tablet().active_store().unwrap().id();
        m.rotate(true).unwrap();
        commit(&mut m, 2, 11, 20, &[write_a(2, 2)]);
        let chunk = m.flush_store(first).unwrap();
        assert!(m.tablet().find_store(first).is_none());
        assert!(m.tablet().find_store(chunk).is_some());
        assert_eq!(read_all(&m, 100).len(), 2);
    }
}

#[cfg(test)]
mod replication_tests {
    use std::sync::Arc;

    use tablet_common::bg_supervisor::BgActivitySupervisor;
    use tablet_common::config::TabletManagerConfig;
    use tablet_common::schema::TableSchema;
    use tablet_common::types::{TabletId, Timestamp, TxnId};
    use tablet_common::value::{Value, ValueType, VersionedRow, VersionedValue};

    use crate::comparer::RowKey;
    use crate::reader::versioned_lookup_row;
    use crate::store_manager::{SortedStoreManager, StoreManager, WireCommand, WriteContext};
    use crate::tablet::Tablet;

    fn manager() -> SortedStoreManager {
        let schema = Arc::new(TableSchema::sorted(&[ValueType::Int64], &[ValueType::String]));
        let tablet = Tablet::new(TabletId(3), schema, Arc::new(TabletManagerConfig::default()));
        let mut m = SortedStoreManager::new(tablet, Arc::new(BgActivitySupervisor::new()));
        m.mount().unwrap();
        m
    }

    fn versioned(k: i64, s: &str, ts: u64) -> WireCommand {
        WireCommand::WriteVersionedRow(VersionedRow::from_values(
            vec![Value::Int64(k)],
            vec![VersionedValue::new(1, s, Timestamp(ts))],
        ))
    }

    #[test]
    fn test_versioned_writes_keep_history_in_order() {
        let mut m = manager();
        let mut ctx = WriteContext::new(TxnId::NONE, Timestamp::NULL);
        m.execute_writes(&[versioned(1, "a", 10)], &mut ctx).unwrap();
        m.execute_writes(&[versioned(1, "b", 20)], &mut ctx).unwrap();
        assert!(m.execute_writes(&[versioned(1, "c", 15)], &mut ctx).is_err());

        let row = versioned_lookup_row(&m.tablet().snapshot(), &RowKey(vec![Value::Int64(1)]), Timestamp::MAX, None)
            .unwrap()
            .unwrap();
        assert_eq!(row.write_timestamps, vec![Timestamp(20), Timestamp(10)]);
        assert_eq!(row.values[0].value, Value::String("b".into()));
        assert!(ctx.locked_rows.is_empty());
    }
}
