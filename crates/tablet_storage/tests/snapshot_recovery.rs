//! Save a tablet to disk, reload it and keep writing.

use std::sync::Arc;

use tablet_common::bg_supervisor::BgActivitySupervisor;
use tablet_common::config::TabletManagerConfig;
use tablet_common::schema::TableSchema;
use tablet_common::types::{TabletId, Timestamp, TxnId};
use tablet_common::value::{UnversionedRow, UnversionedValue, Value, ValueType};
use tablet_common::TabletError;

use tablet_storage::reader::{create_schemaful_tablet_reader, read_ordered_rows};
use tablet_storage::snapshot::{load_tablet, save_tablet, TabletImage, SNAPSHOT_FORMAT_VERSION};
use tablet_storage::{KeyBound, OrderedStoreManager, SortedStoreManager, StoreManager, Tablet, WireCommand, WriteContext};

fn config() -> Arc<TabletManagerConfig> {
    Arc::new(TabletManagerConfig::default())
}

fn write(k: i64, v: &str) -> WireCommand {
    WireCommand::WriteRow(UnversionedRow::new(vec![
        UnversionedValue::new(0, k),
        UnversionedValue::new(1, v),
    ]))
}

fn commit(m: &mut SortedStoreManager, txn: u64, start_ts: u64, commit_ts: u64, commands: &[WireCommand]) {
    let mut ctx = WriteContext::new(TxnId(txn), Timestamp(start_ts));
    m.execute_writes(commands, &mut ctx).unwrap();
    for row in &ctx.locked_rows {
        m.commit_row(row, TxnId(txn), Timestamp(commit_ts)).unwrap();
    }
}

fn keys(m: &SortedStoreManager) -> Vec<(i64, String)> {
    create_schemaful_tablet_reader(&m.tablet().snapshot(), KeyBound::Min, KeyBound::Max, Timestamp::MAX, None)
        .unwrap()
        .map(|r| match (&r.values[0].value, &r.values[1].value) {
            (Value::Int64(k), Value::String(s)) => (*k, s.clone()),
            other => panic!("unexpected row {:?}", other),
        })
        .collect()
}

#[test]
fn sorted_tablet_reload_and_continue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sorted.tablet");

    let schema = Arc::new(TableSchema::sorted(&[ValueType::Int64], &[ValueType::String]));
    let mut m = SortedStoreManager::new(
        Tablet::new(TabletId(11), schema, config()),
        Arc::new(BgActivitySupervisor::new()),
    );
    m.mount().unwrap();
    commit(&mut m, 1, 1, 10, &[write(1, "one"), write(2, "two")]);
    let passive = m.tablet().active_store().unwrap().id();
    m.rotate(true).unwrap();
    m.flush_store(passive).unwrap();
    commit(&mut m, 2, 11, 20, &[write(3, "three")]);

    // in flight at save time
    let mut pending = WriteContext::new(TxnId(3), Timestamp(21));
    m.execute_writes(&[write(4, "four")], &mut pending).unwrap();

    save_tablet(m.tablet(), &path).unwrap();
    let mut reloaded = SortedStoreManager::new(load_tablet(&path, config()).unwrap(), Arc::new(BgActivitySupervisor::new()));
    reloaded.mount().unwrap();
    assert!(!reloaded.has_active_locks());
    assert_eq!(keys(&reloaded), keys(&m));

    // an old start timestamp still conflicts with the reloaded commit history
    let mut stale = WriteContext::new(TxnId(4), Timestamp(15));
    assert!(reloaded.execute_writes(&[write(3, "stale")], &mut stale).is_err());

    commit(&mut reloaded, 5, 21, 30, &[write(4, "four")]);
    assert_eq!(keys(&reloaded).len(), 4);
}

#[test]
fn ordered_tablet_reload_keeps_row_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordered.tablet");

    let schema = Arc::new(TableSchema::ordered(&[ValueType::Int64]));
    let mut m = OrderedStoreManager::new(
        Tablet::new(TabletId(12), schema, config()),
        Arc::new(BgActivitySupervisor::new()),
    );
    m.mount().unwrap();
    for i in 0..5i64 {
        m.write_row(UnversionedRow::from_values(vec![Value::Int64(i)]), Timestamp(10 + i as u64))
            .unwrap();
    }
    save_tablet(m.tablet(), &path).unwrap();

    let mut reloaded =
        OrderedStoreManager::new(load_tablet(&path, config()).unwrap(), Arc::new(BgActivitySupervisor::new()));
    reloaded.mount().unwrap();
    assert_eq!(reloaded.write_row(UnversionedRow::from_values(vec![Value::Int64(5)]), Timestamp(20)).unwrap(), 5);
    let rows = read_ordered_rows(&reloaded.tablet().snapshot(), 3, 6).unwrap();
    assert_eq!(rows.iter().map(|r| r.row_index).collect::<Vec<_>>(), vec![3, 4, 5]);
}

#[test]
fn newer_format_is_rejected() {
    let schema = Arc::new(TableSchema::sorted(&[ValueType::Int64], &[ValueType::String]));
    let tablet = Tablet::new(TabletId(13), schema, config());
    let mut bytes = TabletImage::save(&tablet).encode().unwrap();
    bytes[4..8].copy_from_slice(&(SNAPSHOT_FORMAT_VERSION + 1).to_le_bytes());
    let err = TabletImage::decode(&bytes).unwrap_err();
    assert!(matches!(err, TabletError::SnapshotVersion { .. }));
}
