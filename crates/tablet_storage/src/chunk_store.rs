//! Immutable stores produced by flush and compaction.
//!
//! A flush turns a passive dynamic store into a [`FlushedChunk`]; the store
//! manager then installs it as a [`SortedChunkStore`] or [`OrderedChunkStore`].
//! Chunks serialize as a checksummed frame:
//!
//! ```text
//!   [len:4][crc32:4][bincode(FlushedChunk):len]
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{StoreId, Timestamp};
use tablet_common::value::{ColumnId, VersionedRow};

use crate::comparer::{compare_keys, KeyBound, RowKey};
use crate::ordered_dynamic_store::OrderedRow;
use crate::store::{StoreMeta, StoreState};

const FRAME_HEADER_SIZE: usize = 8;

/// Rows of a flushed or compacted chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChunkRows {
    /// Versioned rows in key order.
    Sorted(Vec<VersionedRow>),
    Ordered {
        starting_row_index: u64,
        rows: Vec<OrderedRow>,
    },
}

impl ChunkRows {
    pub fn row_count(&self) -> usize {
        match self {
            ChunkRows::Sorted(rows) => rows.len(),
            ChunkRows::Ordered { rows, .. } => rows.len(),
        }
    }
}

/// Output of a flush or compaction callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushedChunk {
    /// Store the rows were taken from.
    pub source_store_id: StoreId,
    pub rows: ChunkRows,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
}

impl FlushedChunk {
    pub fn encode(&self) -> TabletResult<Vec<u8>> {
        let data = bincode::serialize(self)?;
        let checksum = crc32fast::hash(&data);
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&data);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> TabletResult<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(TabletError::SnapshotCorrupted(format!(
                "chunk frame truncated: {} bytes",
                bytes.len()
            )));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let checksum = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let data = &bytes[FRAME_HEADER_SIZE..];
        if data.len() != len {
            return Err(TabletError::SnapshotCorrupted(format!(
                "chunk frame declares {} bytes, found {}",
                len,
                data.len()
            )));
        }
        let actual = crc32fast::hash(data);
        if actual != checksum {
            return Err(TabletError::SnapshotCorrupted(format!(
                "chunk checksum mismatch: expected {:#x}, actual {:#x}",
                checksum, actual
            )));
        }
        Ok(bincode::deserialize(data)?)
    }
}

/// Cuts a versioned row at `timestamp` and restricts it to `column_filter`.
/// Returns `None` when nothing of the row is visible.
pub(crate) fn cut_versioned_row(
    row: &VersionedRow,
    timestamp: Timestamp,
    column_filter: Option<&[ColumnId]>,
) -> Option<VersionedRow> {
    let write_timestamps: Vec<Timestamp> = row
        .write_timestamps
        .iter()
        .copied()
        .filter(|ts| *ts <= timestamp)
        .collect();
    let delete_timestamps: Vec<Timestamp> = row
        .delete_timestamps
        .iter()
        .copied()
        .filter(|ts| *ts <= timestamp)
        .collect();
    if write_timestamps.is_empty() && delete_timestamps.is_empty() {
        return None;
    }
    let values = row
        .values
        .iter()
        .filter(|v| v.timestamp <= timestamp)
        .filter(|v| column_filter.map(|f| f.contains(&v.id)).unwrap_or(true))
        .cloned()
        .collect();
    Some(VersionedRow {
        keys: row.keys.clone(),
        values,
        write_timestamps,
        delete_timestamps,
    })
}

/// Sorted rows frozen by a flush or compaction.
pub struct SortedChunkStore {
    meta: StoreMeta,
    rows: Vec<VersionedRow>,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

impl SortedChunkStore {
    /// `rows` must be in key order with unique keys.
    pub fn new(id: StoreId, rows: Vec<VersionedRow>, min_timestamp: Timestamp, max_timestamp: Timestamp) -> Self {
        Self {
            meta: StoreMeta::new(id, StoreState::Persistent),
            rows,
            min_timestamp,
            max_timestamp,
        }
    }

    pub fn from_chunk(id: StoreId, chunk: FlushedChunk) -> TabletResult<Self> {
        match chunk.rows {
            ChunkRows::Sorted(rows) => {
                if rows
                    .windows(2)
                    .any(|w| compare_keys(&w[0].keys, &w[1].keys) != Ordering::Less)
                {
                    return Err(TabletError::internal(
                        "CHUNK_ROWS_UNSORTED",
                        format!("chunk from store {} is not in key order", chunk.source_store_id),
                    ));
                }
                Ok(Self::new(id, rows, chunk.min_timestamp, chunk.max_timestamp))
            }
            ChunkRows::Ordered { .. } => Err(TabletError::internal(
                "CHUNK_KIND_MISMATCH",
                "ordered chunk cannot back a sorted store",
            )),
        }
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn id(&self) -> StoreId {
        self.meta.id()
    }

    pub fn rows(&self) -> &[VersionedRow] {
        &self.rows
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    pub fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    /// First key of the chunk; `Max` for an empty chunk so it intersects nothing.
    pub fn min_key(&self) -> KeyBound {
        self.rows
            .first()
            .map(|r| KeyBound::key(r.keys.clone()))
            .unwrap_or(KeyBound::Max)
    }

    /// Last key of the chunk (inclusive); `Min` for an empty chunk.
    pub fn max_key(&self) -> KeyBound {
        self.rows
            .last()
            .map(|r| KeyBound::key(r.keys.clone()))
            .unwrap_or(KeyBound::Min)
    }

    fn lower_index(&self, bound: &KeyBound) -> usize {
        match bound {
            KeyBound::Min => 0,
            KeyBound::Key(k) => self
                .rows
                .partition_point(|r| compare_keys(&r.keys, k.values()) == Ordering::Less),
            KeyBound::Max => self.rows.len(),
        }
    }

    pub fn read_range(
        &self,
        lower: &KeyBound,
        upper: &KeyBound,
        timestamp: Timestamp,
        column_filter: Option<&[ColumnId]>,
    ) -> Vec<VersionedRow> {
        let begin = self.lower_index(lower);
        let end = self.lower_index(upper).max(begin);
        self.rows[begin..end]
            .iter()
            .filter_map(|r| cut_versioned_row(r, timestamp, column_filter))
            .collect()
    }

    pub fn lookup_row(
        &self,
        key: &RowKey,
        timestamp: Timestamp,
        column_filter: Option<&[ColumnId]>,
    ) -> Option<VersionedRow> {
        self.rows
            .binary_search_by(|r| compare_keys(&r.keys, key.values()))
            .ok()
            .and_then(|i| cut_versioned_row(&self.rows[i], timestamp, column_filter))
    }
}

/// Ordered rows frozen by a flush.
pub struct OrderedChunkStore {
    meta: StoreMeta,
    starting_row_index: u64,
    rows: Vec<OrderedRow>,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

impl OrderedChunkStore {
    pub fn from_chunk(id: StoreId, chunk: FlushedChunk) -> TabletResult<Self> {
        match chunk.rows {
            ChunkRows::Ordered {
                starting_row_index,
                rows,
            } => Ok(Self {
                meta: StoreMeta::new(id, StoreState::Persistent),
                starting_row_index,
                rows,
                min_timestamp: chunk.min_timestamp,
                max_timestamp: chunk.max_timestamp,
            }),
            ChunkRows::Sorted(_) => Err(TabletError::internal(
                "CHUNK_KIND_MISMATCH",
                "sorted chunk cannot back an ordered store",
            )),
        }
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn id(&self) -> StoreId {
        self.meta.id()
    }

    pub fn starting_row_index(&self) -> u64 {
        self.starting_row_index
    }

    pub fn end_row_index(&self) -> u64 {
        self.starting_row_index + self.rows.len() as u64
    }

    pub fn rows(&self) -> &[OrderedRow] {
        &self.rows
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn min_timestamp(&self) -> Timestamp {
        self.min_timestamp
    }

    pub fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    pub fn read_rows(&self, lower: u64, upper: u64) -> Vec<OrderedRow> {
        let lower = lower.max(self.starting_row_index);
        let upper = upper.min(self.end_row_index());
        if lower >= upper {
            return Vec::new();
        }
        let begin = (lower - self.starting_row_index) as usize;
        let end = (upper - self.starting_row_index) as usize;
        self.rows[begin..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::value::{Value, VersionedValue};

    fn vrow(k: i64, ts: u64) -> VersionedRow {
        VersionedRow::from_values(
            vec![Value::Int64(k)],
            vec![VersionedValue::new(1, k * 10, Timestamp(ts))],
        )
    }

    fn chunk(rows: Vec<VersionedRow>) -> FlushedChunk {
        FlushedChunk {
            source_store_id: StoreId(1),
            rows: ChunkRows::Sorted(rows),
            min_timestamp: Timestamp(0x10),
            max_timestamp: Timestamp(0x40),
        }
    }

    #[test]
    fn test_frame_checksum_detects_corruption() {
        let c = chunk(vec![vrow(1, 0x10), vrow(2, 0x20)]);
        let mut bytes = c.encode().unwrap();
        assert_eq!(FlushedChunk::decode(&bytes).unwrap(), c);

        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = FlushedChunk::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(FlushedChunk::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn test_sorted_chunk_bounds_and_range() {
        let store = SortedChunkStore::from_chunk(
            StoreId(7),
            chunk((1..=5).map(|k| vrow(k, 0x10 + k as u64)).collect()),
        )
        .unwrap();
        assert_eq!(store.meta().state(), StoreState::Persistent);
        assert_eq!(store.min_key(), KeyBound::key(vec![Value::Int64(1)]));
        assert_eq!(store.max_key(), KeyBound::key(vec![Value::Int64(5)]));

        let rows = store.read_range(
            &KeyBound::key(vec![Value::Int64(2)]),
            &KeyBound::key(vec![Value::Int64(4)]),
            Timestamp::ALL_COMMITTED,
            None,
        );
        let keys: Vec<i64> = rows.iter().map(|r| r.keys[0].as_i64().unwrap()).collect();
        assert_eq!(keys, vec![2, 3]);

        // rows written after the read timestamp are invisible
        let rows = store.read_range(&KeyBound::Min, &KeyBound::Max, Timestamp(0x13), None);
        assert_eq!(rows.len(), 3);

        let key = RowKey(vec![Value::Int64(4)]);
        assert!(store.lookup_row(&key, Timestamp::ALL_COMMITTED, None).is_some());
        assert!(store.lookup_row(&key, Timestamp(0x10), None).is_none());
    }

    #[test]
    fn test_unsorted_chunk_rejected() {
        let err = SortedChunkStore::from_chunk(StoreId(1), chunk(vec![vrow(2, 1), vrow(1, 1)]));
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_chunk_intersects_nothing() {
        let store = SortedChunkStore::from_chunk(StoreId(1), chunk(Vec::new())).unwrap();
        assert!(store.min_key() > store.max_key());
    }

    #[test]
    fn test_column_filter() {
        let row = VersionedRow::from_values(
            vec![Value::Int64(1)],
            vec![
                VersionedValue::new(1, 5i64, Timestamp(3)),
                VersionedValue::new(2, 6i64, Timestamp(3)),
            ],
        );
        let cut = cut_versioned_row(&row, Timestamp::MAX, Some(&[2])).unwrap();
        assert_eq!(cut.values.len(), 1);
        assert_eq!(cut.values[0].id, 2);
    }
}
