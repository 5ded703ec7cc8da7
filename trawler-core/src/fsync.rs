//! Debounced file syncs, keyed by path.
//!
//! Shards hand snapshot, WAL and blob-volume paths here instead of
//! syncing inline; repeated requests for the same file coalesce.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::DataPlaneConfig;
use crate::debounce::{DebounceTimings, Debouncer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsyncMode {
    /// `fsync`: data and metadata.
    Full,
    /// `fdatasync`: data only.
    Data,
}

pub struct AsyncFsync {
    debouncer: Debouncer<PathBuf, FsyncMode>,
}

impl AsyncFsync {
    pub fn new(config: &DataPlaneConfig) -> AsyncFsync {
        let timings = DebounceTimings::from_millis(
            config.fsync_throttle_ms,
            config.fsync_debounce_ms,
            config.fsync_debounce_busy_ms,
            config.fsync_force_ms,
        );
        AsyncFsync {
            debouncer: Debouncer::new(
                "fsync",
                config.fsync_threads,
                timings,
                |path: PathBuf, mode| match File::open(&path) {
                    Ok(file) => {
                        let result = match mode {
                            FsyncMode::Full => file.sync_all(),
                            FsyncMode::Data => file.sync_data(),
                        };
                        if let Err(e) = result {
                            tracing::warn!(path = %path.display(), error = %e, "fsync failed");
                        }
                    }
                    Err(e) => {
                        // The file may have been rotated or removed since
                        // the sync was requested.
                        tracing::debug!(path = %path.display(), error = %e, "fsync skipped");
                    }
                },
            ),
        }
    }

    pub fn debounce(&self, path: PathBuf, mode: FsyncMode) {
        self.debouncer.debounce(path, mode);
    }

    pub fn finish(&self) {
        self.debouncer.finish();
    }

    pub fn join(&self, timeout: Duration) -> bool {
        self.debouncer.join(timeout)
    }
}
