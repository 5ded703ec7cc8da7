//! The engine context: pool, committer and fsync debouncers constructed
//! once at startup and injected into shards on reopen.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::committer::Committer;
use crate::config::DataPlaneConfig;
use crate::database::Database;
use crate::endpoint::Endpoints;
use crate::errors::Result;
use crate::events::EventHooks;
use crate::flags::OpenFlags;
use crate::fsync::AsyncFsync;
use crate::pool::{DatabasePool, Timeout};
use crate::shard::Shard;

pub use crate::fsync::FsyncMode;

pub struct DataPlane {
    pub config: Arc<DataPlaneConfig>,
    pub pool: Arc<DatabasePool>,
    pub committer: Committer,
    pub fsync: AsyncFsync,
    pub events: EventHooks,
}

impl DataPlane {
    pub fn new(config: DataPlaneConfig) -> Arc<DataPlane> {
        Arc::new_cyclic(|weak| {
            let config = Arc::new(config);
            DataPlane {
                pool: DatabasePool::new(Arc::clone(&config), weak.clone()),
                committer: Committer::new(&config, weak.clone()),
                fsync: AsyncFsync::new(&config),
                events: EventHooks::new(),
                config,
            }
        })
    }

    /// Checkout entry point for front-ends: all-or-nothing over the
    /// endpoint list.
    pub fn checkout(
        self: &Arc<Self>,
        endpoints: &Endpoints,
        flags: OpenFlags,
        timeout: Timeout,
    ) -> Result<Vec<Arc<Shard>>> {
        self.pool.checkout_endpoints(endpoints, flags, timeout)
    }

    /// Checkin never fails; shard errors are logged and the shards freed.
    pub fn checkin(&self, mut shards: Vec<Arc<Shard>>) {
        self.pool.checkin_shards(&mut shards);
    }

    /// Checks out every endpoint and wraps the shards as one logical
    /// database.
    pub fn database(
        self: &Arc<Self>,
        endpoints: &Endpoints,
        flags: OpenFlags,
        timeout: Timeout,
    ) -> Result<Database> {
        let shards = self.pool.checkout_endpoints(endpoints, flags, timeout)?;
        Ok(Database::new(shards, endpoints.clone(), flags))
    }

    pub fn release(&self, database: Database) {
        let mut shards = database.into_shards();
        self.pool.checkin_shards(&mut shards);
    }

    /// Cascades shutdown: no new checkouts, then bounded reclamation.
    pub fn finish(&self) {
        self.pool.finish();
        self.committer.finish();
        self.fsync.finish();
    }

    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ok = self.pool.join(deadline);
        let remaining = deadline.saturating_duration_since(Instant::now());
        ok &= self.committer.join(remaining.max(Duration::from_millis(10)));
        let remaining = deadline.saturating_duration_since(Instant::now());
        ok &= self.fsync.join(remaining.max(Duration::from_millis(10)));
        ok
    }
}
