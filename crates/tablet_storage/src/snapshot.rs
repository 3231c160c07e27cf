//! Tablet snapshot: committed store contents plus the partition layout.
//!
//! ```text
//! +--------+-------------+------------+-----------+------------------+
//! | "TBLS" | version u32 | length u32 | crc32 u32 | bincode payload  |
//! +--------+-------------+------------+-----------+------------------+
//! ```
//!
//! Locks and uncommitted slots are not saved; transactions that were in
//! flight relock their rows from their write logs after load.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tablet_common::config::TabletManagerConfig;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::schema::TableSchema;
use tablet_common::types::{PartitionId, StoreId, TabletId, Timestamp};
use tablet_common::value::VersionedRow;

use crate::chunk_store::{ChunkRows, FlushedChunk, OrderedChunkStore, SortedChunkStore};
use crate::ordered_dynamic_store::{OrderedDynamicStore, OrderedRow};
use crate::sorted_dynamic_store::{SavedDynamicRow, SortedDynamicStore};
use crate::store::{Store, StoreState};
use crate::tablet::{Partition, Tablet};

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"TBLS";
/// Bumped whenever the payload layout changes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 2;
/// Oldest payload layout this build still reads.
pub const MIN_SNAPSHOT_FORMAT_VERSION: u32 = 2;

const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SavedStore {
    SortedDynamic {
        id: StoreId,
        state: StoreState,
        rows: Vec<SavedDynamicRow>,
    },
    SortedChunk {
        id: StoreId,
        rows: Vec<VersionedRow>,
        min_timestamp: Timestamp,
        max_timestamp: Timestamp,
    },
    OrderedDynamic {
        id: StoreId,
        state: StoreState,
        starting_row_index: u64,
        rows: Vec<OrderedRow>,
    },
    OrderedChunk {
        id: StoreId,
        starting_row_index: u64,
        rows: Vec<OrderedRow>,
        min_timestamp: Timestamp,
        max_timestamp: Timestamp,
    },
}

impl SavedStore {
    fn save(store: &Store) -> Self {
        match store {
            Store::SortedDynamic(s) => SavedStore::SortedDynamic {
                id: s.id(),
                state: s.meta().state(),
                rows: s.saved_rows(),
            },
            Store::SortedChunk(s) => SavedStore::SortedChunk {
                id: s.id(),
                rows: s.rows().to_vec(),
                min_timestamp: s.min_timestamp(),
                max_timestamp: s.max_timestamp(),
            },
            Store::OrderedDynamic(s) => SavedStore::OrderedDynamic {
                id: s.id(),
                state: s.meta().state(),
                starting_row_index: s.starting_row_index(),
                rows: s.get_all_rows(),
            },
            Store::OrderedChunk(s) => SavedStore::OrderedChunk {
                id: s.id(),
                starting_row_index: s.starting_row_index(),
                rows: s.rows().to_vec(),
                min_timestamp: s.min_timestamp(),
                max_timestamp: s.max_timestamp(),
            },
        }
    }

    fn restore(self, tablet_id: TabletId, schema: &Arc<TableSchema>, config: &TabletManagerConfig) -> TabletResult<Store> {
        let store = match self {
            SavedStore::SortedDynamic { id, state, rows } => {
                let store = SortedDynamicStore::new(id, tablet_id, schema.clone(), config.edit_list.clone());
                for row in &rows {
                    store.restore_row(row)?;
                }
                store.meta().set_state(state);
                Store::SortedDynamic(Arc::new(store))
            }
            SavedStore::SortedChunk {
                id,
                rows,
                min_timestamp,
                max_timestamp,
            } => Store::SortedChunk(Arc::new(SortedChunkStore::from_chunk(
                id,
                FlushedChunk {
                    source_store_id: id,
                    rows: ChunkRows::Sorted(rows),
                    min_timestamp,
                    max_timestamp,
                },
            )?)),
            SavedStore::OrderedDynamic {
                id,
                state,
                starting_row_index,
                rows,
            } => {
                let store = OrderedDynamicStore::load(id, tablet_id, schema.clone(), starting_row_index, rows)?;
                store.meta().set_state(state);
                Store::OrderedDynamic(Arc::new(store))
            }
            SavedStore::OrderedChunk {
                id,
                starting_row_index,
                rows,
                min_timestamp,
                max_timestamp,
            } => Store::OrderedChunk(Arc::new(OrderedChunkStore::from_chunk(
                id,
                FlushedChunk {
                    source_store_id: id,
                    rows: ChunkRows::Ordered {
                        starting_row_index,
                        rows,
                    },
                    min_timestamp,
                    max_timestamp,
                },
            )?)),
        };
        Ok(store)
    }
}

/// Everything a tablet needs to come back after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletImage {
    pub tablet_id: TabletId,
    pub schema: TableSchema,
    pub eden: Partition,
    pub partitions: Vec<Partition>,
    pub stores: Vec<SavedStore>,
    pub active_store_id: Option<StoreId>,
    pub next_store_id: StoreId,
    pub next_partition_id: PartitionId,
}

impl TabletImage {
    pub fn save(tablet: &Tablet) -> Self {
        Self {
            tablet_id: tablet.id(),
            schema: tablet.schema().as_ref().clone(),
            eden: tablet.eden().clone(),
            partitions: tablet.partitions().to_vec(),
            stores: tablet.stores().map(SavedStore::save).collect(),
            active_store_id: tablet.active_store().map(|s| s.id()),
            next_store_id: tablet.next_store_id(),
            next_partition_id: tablet.next_partition_id(),
        }
    }

    pub fn restore(self, config: Arc<TabletManagerConfig>) -> TabletResult<Tablet> {
        let schema = Arc::new(self.schema);
        let stores = self
            .stores
            .into_iter()
            .map(|s| s.restore(self.tablet_id, &schema, &config))
            .collect::<TabletResult<Vec<Store>>>()?;
        let tablet = Tablet::restore(
            self.tablet_id,
            schema,
            config,
            self.eden,
            self.partitions,
            stores,
            self.active_store_id,
            self.next_store_id,
            self.next_partition_id,
        )?;
        tracing::info!(
            tablet_id = %tablet.id(),
            store_count = tablet.store_count(),
            "tablet restored from snapshot"
        );
        Ok(tablet)
    }

    pub fn encode(&self) -> TabletResult<Vec<u8>> {
        Ok(write_frame(SNAPSHOT_MAGIC, SNAPSHOT_FORMAT_VERSION, &bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> TabletResult<Self> {
        let payload = read_frame(bytes, SNAPSHOT_MAGIC, MIN_SNAPSHOT_FORMAT_VERSION, SNAPSHOT_FORMAT_VERSION)?;
        bincode::deserialize(payload).map_err(|e| TabletError::SnapshotCorrupted(e.to_string()))
    }
}

/// Wraps `payload` in a magic/version/length/crc32 header.
pub fn write_frame(magic: &[u8; 4], version: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validates the header written by [`write_frame`] and returns the payload.
pub fn read_frame<'a>(bytes: &'a [u8], magic: &[u8; 4], min_version: u32, version: u32) -> TabletResult<&'a [u8]> {
    if bytes.len() < HEADER_SIZE {
        return Err(TabletError::SnapshotCorrupted(format!(
            "snapshot is {} bytes, header needs {}",
            bytes.len(),
            HEADER_SIZE
        )));
    }
    if &bytes[0..4] != magic.as_slice() {
        return Err(TabletError::SnapshotCorrupted("bad snapshot magic".into()));
    }
    let found = read_u32(bytes, 4);
    if !(min_version..=version).contains(&found) {
        return Err(TabletError::SnapshotVersion {
            found,
            min_supported: min_version,
            current: version,
        });
    }
    let len = read_u32(bytes, 8) as usize;
    let expected_crc = read_u32(bytes, 12);
    let payload = bytes.get(HEADER_SIZE..HEADER_SIZE + len).ok_or_else(|| {
        TabletError::SnapshotCorrupted(format!("snapshot payload truncated: expected {} bytes", len))
    })?;
    let actual_crc = crc32fast::hash(payload);
    if actual_crc != expected_crc {
        return Err(TabletError::SnapshotCorrupted(format!(
            "snapshot checksum mismatch: expected {:#010x}, got {:#010x}",
            expected_crc, actual_crc
        )));
    }
    Ok(payload)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Writes the snapshot of `tablet` to `path` atomically (temp file + rename).
pub fn save_tablet(tablet: &Tablet, path: &Path) -> TabletResult<()> {
    let bytes = TabletImage::save(tablet).encode()?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    metrics::counter!("tablet_snapshot_saved_total").increment(1);
    tracing::debug!(tablet_id = %tablet.id(), bytes = bytes.len(), path = %path.display(), "tablet snapshot saved");
    Ok(())
}

pub fn load_tablet(path: &Path, config: Arc<TabletManagerConfig>) -> TabletResult<Tablet> {
    let bytes = fs::read(path)?;
    TabletImage::decode(&bytes)?.restore(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::{KeyBound, RowKey};
    use crate::reader::{create_schemaful_tablet_reader, versioned_lookup_row};
    use tablet_common::types::TxnId;
    use tablet_common::value::{UnversionedRow, UnversionedValue, Value, ValueType, VersionedValue};

    fn sorted_tablet() -> Tablet {
        let schema = Arc::new(TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64, ValueType::String]));
        let mut tablet = Tablet::new(TabletId(7), schema.clone(), Arc::new(TabletManagerConfig::default()));
        let id = tablet.generate_store_id();
        let store = Arc::new(SortedDynamicStore::new(id, TabletId(7), schema, Default::default()));
        let store_ref = Store::SortedDynamic(store.clone());
        tablet.add_store(store_ref.clone(), None).unwrap();
        tablet.set_active_store(Some(store_ref));

        for (k, ts) in [(1i64, 10u64), (2, 20)] {
            let row = store.write_row(RowKey(vec![Value::Int64(k)]));
            let txn = TxnId(k as u64);
            let mask = store.write_lock_mask(&UnversionedRow::new(vec![UnversionedValue::new(1, k * 10)]));
            store.acquire_row_locks(&row, txn, mask);
            store
                .prepare_write(&row, &UnversionedRow::new(vec![UnversionedValue::new(1, k * 10)]))
                .unwrap();
            store.commit_row(&row, txn, Timestamp(ts)).unwrap();
        }
        // left uncommitted; must not survive the snapshot
        let pending = store.write_row(RowKey(vec![Value::Int64(3)]));
        let mask = store.write_lock_mask(&UnversionedRow::new(vec![UnversionedValue::new(1, 30i64)]));
        store.acquire_row_locks(&pending, TxnId(3), mask);
        store
            .prepare_write(&pending, &UnversionedRow::new(vec![UnversionedValue::new(1, 30i64)]))
            .unwrap();

        let chunk_id = tablet.generate_store_id();
        let chunk = SortedChunkStore::new(
            chunk_id,
            vec![VersionedRow::from_values(
                vec![Value::Int64(5)],
                vec![VersionedValue::new(2, "five", Timestamp(5))],
            )],
            Timestamp(5),
            Timestamp(5),
        );
        tablet.add_store(Store::SortedChunk(Arc::new(chunk)), None).unwrap();
        tablet.split_partition(0, vec![RowKey(vec![Value::Int64(100)])]).unwrap();
        tablet.publish_snapshot();
        tablet
    }

    #[test]
    fn test_save_load_keeps_committed_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tablet.snapshot");
        let tablet = sorted_tablet();
        save_tablet(&tablet, &path).unwrap();

        let loaded = load_tablet(&path, Arc::new(TabletManagerConfig::default())).unwrap();
        assert_eq!(loaded.id(), TabletId(7));
        assert_eq!(loaded.store_count(), 2);
        assert_eq!(loaded.partitions().len(), 2);
        assert_eq!(loaded.next_store_id(), tablet.next_store_id());
        assert_eq!(loaded.next_partition_id(), tablet.next_partition_id());

        let active = loaded.active_store().unwrap().as_sorted_dynamic().unwrap().clone();
        assert_eq!(active.lock_count(), 0);
        assert!(active.locked_rows().is_empty());

        let snapshot = loaded.snapshot();
        let rows: Vec<i64> = create_schemaful_tablet_reader(&snapshot, KeyBound::Min, KeyBound::Max, Timestamp::MAX, None)
            .unwrap()
            .map(|r| r.values[0].value.as_i64().unwrap())
            .collect();
        assert_eq!(rows, vec![1, 2, 5]);

        let before = versioned_lookup_row(&tablet.snapshot(), &RowKey(vec![Value::Int64(2)]), Timestamp::MAX, None).unwrap();
        let after = versioned_lookup_row(&snapshot, &RowKey(vec![Value::Int64(2)]), Timestamp::MAX, None).unwrap();
        assert_eq!(before, after);
        assert_eq!(active.find_row(&RowKey(vec![Value::Int64(2)])).unwrap().lock_write_timestamps(0), vec![Timestamp(20)]);
    }

    #[test]
    fn test_version_checked_before_payload() {
        let mut bytes = TabletImage::save(&sorted_tablet()).encode().unwrap();
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        match TabletImage::decode(&bytes) {
            Err(TabletError::SnapshotVersion { found, min_supported, current }) => {
                assert_eq!(found, 1);
                assert_eq!(min_supported, MIN_SNAPSHOT_FORMAT_VERSION);
                assert_eq!(current, SNAPSHOT_FORMAT_VERSION);
            }
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
        bytes[4..8].copy_from_slice(&(SNAPSHOT_FORMAT_VERSION + 1).to_le_bytes());
        assert!(matches!(TabletImage::decode(&bytes), Err(TabletError::SnapshotVersion { .. })));
    }

    #[test]
    fn test_corruption_detected() {
        let bytes = TabletImage::save(&sorted_tablet()).encode().unwrap();

        let mut flipped = bytes.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0xff;
        assert!(matches!(TabletImage::decode(&flipped), Err(TabletError::SnapshotCorrupted(_))));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(TabletImage::decode(&bad_magic), Err(TabletError::SnapshotCorrupted(_))));

        assert!(matches!(
            TabletImage::decode(&bytes[..bytes.len() - 3]),
            Err(TabletError::SnapshotCorrupted(_))
        ));
    }

    #[test]
    fn test_ordered_tablet_round_trip() {
        let schema = Arc::new(TableSchema::ordered(&[ValueType::String]));
        let mut tablet = Tablet::new(TabletId(9), schema.clone(), Arc::new(TabletManagerConfig::default()));
        let id = tablet.generate_store_id();
        let store = Arc::new(OrderedDynamicStore::new(id, TabletId(9), schema, 0));
        store
            .write_row(UnversionedRow::from_values(vec![Value::String("a".into())]), Timestamp(3))
            .unwrap();
        store
            .write_row(UnversionedRow::from_values(vec![Value::String("b".into())]), Timestamp(4))
            .unwrap();
        let store_ref = Store::OrderedDynamic(store.clone());
        tablet.add_store(store_ref.clone(), None).unwrap();
        tablet.set_active_store(Some(store_ref));

        let image = TabletImage::save(&tablet);
        let loaded = TabletImage::decode(&image.encode().unwrap())
            .unwrap()
            .restore(Arc::new(TabletManagerConfig::default()))
            .unwrap();
        let active = loaded.active_store().unwrap().as_ordered_dynamic().unwrap().clone();
        assert_eq!(active.get_all_rows(), store.get_all_rows());
        assert_eq!(loaded.next_ordered_row_index(), 2);
    }
}
