//! Runtime knobs for the data plane.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataPlaneConfig {
    /// Cap on the endpoint LRU.
    pub database_pool_size: usize,
    /// Readable shards allowed per endpoint.
    pub max_database_readers: usize,
    /// Retries for transient backend errors before surfacing.
    pub db_retries: usize,

    /// Committer debouncer windows (milliseconds).
    pub committer_throttle_ms: u64,
    pub committer_debounce_ms: u64,
    pub committer_debounce_busy_ms: u64,
    pub committer_force_ms: u64,
    pub committer_threads: usize,

    /// Async-fsync debouncer windows (milliseconds).
    pub fsync_throttle_ms: u64,
    pub fsync_debounce_ms: u64,
    pub fsync_debounce_busy_ms: u64,
    pub fsync_force_ms: u64,
    pub fsync_threads: usize,

    /// Endpoint eviction TTLs (seconds).
    pub endpoint_overflow_ttl_secs: u64,
    pub endpoint_idle_ttl_secs: u64,

    /// Readable shard staleness windows (seconds).
    pub local_update_interval_secs: u64,
    pub remote_update_interval_secs: u64,

    /// Soft byte cap for a single blob-storage volume.
    pub blob_volume_cap: u64,
    /// Byte size past which a WAL volume is rolled.
    pub wal_volume_cap: u64,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        DataPlaneConfig {
            database_pool_size: 300,
            max_database_readers: 16,
            db_retries: crate::flags::DB_RETRIES,

            committer_throttle_ms: 1000,
            committer_debounce_ms: 100,
            committer_debounce_busy_ms: 500,
            committer_force_ms: 5000,
            committer_threads: 2,

            fsync_throttle_ms: 0,
            fsync_debounce_ms: 10,
            fsync_debounce_busy_ms: 50,
            fsync_force_ms: 500,
            fsync_threads: 2,

            endpoint_overflow_ttl_secs: 60,
            endpoint_idle_ttl_secs: 3600,

            local_update_interval_secs: 10,
            remote_update_interval_secs: 3,

            blob_volume_cap: 256 * 1024 * 1024,
            wal_volume_cap: 64 * 1024 * 1024,
        }
    }
}
