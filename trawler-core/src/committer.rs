//! Debounced auto-commit, keyed by endpoint.
//!
//! Dirty shards are committed a short while after their checkin rather
//! than on every write. The committer holds only a weak reference: if the
//! shard is gone by the time the task fires, the commit is a no-op.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::config::DataPlaneConfig;
use crate::debounce::{DebounceTimings, Debouncer};
use crate::endpoint::Endpoint;
use crate::engine::DataPlane;
use crate::errors::Result;
use crate::flags::OpenFlags;
use crate::pool::Timeout;
use crate::shard::Shard;

const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Committer {
    debouncer: Debouncer<Endpoint, Weak<Shard>>,
}

impl Committer {
    pub fn new(config: &DataPlaneConfig, context: Weak<DataPlane>) -> Committer {
        let timings = DebounceTimings::from_millis(
            config.committer_throttle_ms,
            config.committer_debounce_ms,
            config.committer_debounce_busy_ms,
            config.committer_force_ms,
        );
        Committer {
            debouncer: Debouncer::new(
                "committer",
                config.committer_threads,
                timings,
                move |endpoint: Endpoint, weak_shard: Weak<Shard>| {
                    if weak_shard.upgrade().is_none() {
                        tracing::debug!(%endpoint, "autocommit skipped, shard is gone");
                        return;
                    }
                    let ctx = match context.upgrade() {
                        Some(ctx) => ctx,
                        None => return,
                    };

                    let start = Instant::now();
                    let result = commit_endpoint(&ctx, &endpoint);
                    match result {
                        Ok(committed) => {
                            tracing::debug!(
                                %endpoint,
                                committed,
                                elapsed = ?start.elapsed(),
                                "autocommit finished"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                %endpoint,
                                error = %e,
                                elapsed = ?start.elapsed(),
                                "autocommit failed"
                            );
                        }
                    }
                },
            ),
        }
    }

    pub fn debounce(&self, endpoint: Endpoint, shard: Weak<Shard>) {
        self.debouncer.debounce(endpoint, shard);
    }

    pub fn finish(&self) {
        self.debouncer.finish();
    }

    pub fn join(&self, timeout: Duration) -> bool {
        self.debouncer.join(timeout)
    }
}

fn commit_endpoint(ctx: &Arc<DataPlane>, endpoint: &Endpoint) -> Result<bool> {
    let shard = ctx.pool.checkout(
        endpoint,
        OpenFlags::WRITABLE | OpenFlags::CREATE_OR_OPEN,
        Timeout::After(CHECKOUT_TIMEOUT),
        None,
    )?;
    let result = shard.commit(true, true);
    ctx.pool.checkin(&shard);
    result
}
