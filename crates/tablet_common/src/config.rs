use serde::{Deserialize, Serialize};

/// Tablet engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabletManagerConfig {
    /// Maximum number of stores a single read may merge (default: 256).
    pub max_read_fan_in: usize,
    /// Maximum number of key partitions looked up concurrently by a key-set read (default: 4).
    pub max_parallel_partition_lookups: usize,
    /// Active store rows that trigger overflow rotation (default: 1_000_000).
    pub max_dynamic_store_row_count: u64,
    /// Active store value count that triggers overflow rotation (default: 1_000_000_000).
    pub max_dynamic_store_value_count: u64,
    /// Active store distinct timestamp count that triggers overflow rotation (default: 10_000_000).
    pub max_dynamic_store_timestamp_count: u64,
    /// Approximate active store memory (bytes) that triggers overflow rotation (default: 1 GiB).
    pub max_dynamic_store_pool_size: u64,
    /// Stores older than this are rotated periodically (0 = never, default: 0).
    pub dynamic_store_auto_flush_period_ms: u64,
    /// Edit list sizing.
    pub edit_list: EditListConfig,
    /// Error backoff for background activities.
    pub backoff: BackoffConfig,
}

impl Default for TabletManagerConfig {
    fn default() -> Self {
        Self {
            max_read_fan_in: 256,
            max_parallel_partition_lookups: 4,
            max_dynamic_store_row_count: 1_000_000,
            max_dynamic_store_value_count: 1_000_000_000,
            max_dynamic_store_timestamp_count: 10_000_000,
            max_dynamic_store_pool_size: 1 << 30,
            dynamic_store_auto_flush_period_ms: 0,
            edit_list: EditListConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Capacity policy for per-column edit lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditListConfig {
    /// Capacity of the first list allocated for a column (default: 2).
    pub initial_capacity: usize,
    /// Each chained list is this many times larger than its predecessor (default: 2).
    pub capacity_multiplier: usize,
    /// Upper bound on a single list's capacity (default: 256).
    pub max_capacity: usize,
}

impl Default for EditListConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 2,
            capacity_multiplier: 2,
            max_capacity: 256,
        }
    }
}

impl EditListConfig {
    pub fn next_capacity(&self, previous: Option<usize>) -> usize {
        match previous {
            None => self.initial_capacity.max(1),
            Some(cap) => (cap * self.capacity_multiplier.max(1)).clamp(1, self.max_capacity.max(1)),
        }
    }
}

/// Retry delays after a background activity fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before a failed store flush is retried (default: 60_000).
    pub flush_error_backoff_ms: u64,
    /// Delay before a failed store compaction is retried (default: 60_000).
    pub compaction_error_backoff_ms: u64,
    /// Delay before a failed rotation is retried (default: 10_000).
    pub rotation_error_backoff_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            flush_error_backoff_ms: 60_000,
            compaction_error_backoff_ms: 60_000,
            rotation_error_backoff_ms: 10_000,
        }
    }
}

impl BackoffConfig {
    /// No delays; failed activities become eligible again immediately.
    pub fn immediate() -> Self {
        Self {
            flush_error_backoff_ms: 0,
            compaction_error_backoff_ms: 0,
            rotation_error_backoff_ms: 0,
        }
    }
}
