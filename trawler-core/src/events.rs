//! Hooks for cluster collaborators.
//!
//! The data plane does not implement replication or discovery; it only
//! surfaces the moments they would act on: a commit advanced a shard's
//! revision, or a remote fallback found a stale local copy.

use parking_lot::RwLock;

use crate::endpoint::Endpoint;

type UpdateListener = Box<dyn Fn(&Endpoint) + Send + Sync>;
type ReplicationListener = Box<dyn Fn(&Endpoint, &Endpoint) + Send + Sync>;

#[derive(Default)]
pub struct EventHooks {
    update_listeners: RwLock<Vec<UpdateListener>>,
    replication_listeners: RwLock<Vec<ReplicationListener>>,
}

impl EventHooks {
    pub fn new() -> EventHooks {
        EventHooks::default()
    }

    pub fn on_database_update(&self, listener: impl Fn(&Endpoint) + Send + Sync + 'static) {
        self.update_listeners.write().push(Box::new(listener));
    }

    pub fn on_trigger_replication(
        &self,
        listener: impl Fn(&Endpoint, &Endpoint) + Send + Sync + 'static,
    ) {
        self.replication_listeners.write().push(Box::new(listener));
    }

    pub fn database_updated(&self, endpoint: &Endpoint) {
        for listener in self.update_listeners.read().iter() {
            listener(endpoint);
        }
    }

    pub fn trigger_replication(&self, source: &Endpoint, target: &Endpoint) {
        tracing::debug!(%source, %target, "replication requested");
        for listener in self.replication_listeners.read().iter() {
            listener(source, target);
        }
    }
}
