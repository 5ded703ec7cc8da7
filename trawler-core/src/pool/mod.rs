//! Endpoint brokers and the database pool.
//!
//! A `ShardEndpoint` is the per-endpoint mailbox: it vends at most one
//! writable shard and a bounded set of readable shards, queues callbacks
//! for failed checkouts, and carries the finished/locked latches. The
//! `DatabasePool` is an LRU of endpoints with the cluster-level checkout,
//! exclusive-lock and cleanup entry points.

pub mod lru;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::DataPlaneConfig;
use crate::endpoint::{Endpoint, Endpoints};
use crate::engine::DataPlane;
use crate::errors::{Error, Result};
use crate::flags::OpenFlags;
use crate::shard::Shard;

use lru::{DropAction, LruMap};

/// Checkout deadline semantics: try once, wait up to a deadline, or wait
/// indefinitely (polling each second so `finish` still propagates).
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    Immediate,
    After(Duration),
    Forever,
}

impl Timeout {
    /// Mirrors the seconds convention of the checkout API: negative waits
    /// forever, zero tries once.
    pub fn from_secs_f64(secs: f64) -> Timeout {
        if secs < 0.0 {
            Timeout::Forever
        } else if secs == 0.0 {
            Timeout::Immediate
        } else {
            Timeout::After(Duration::from_secs_f64(secs))
        }
    }
}

pub type CheckinCallback = Box<dyn FnOnce() + Send>;

struct EndpointState {
    writable: Option<Arc<Shard>>,
    readables: Vec<Arc<Shard>>,
    readables_available: usize,
    callbacks: VecDeque<CheckinCallback>,
}

impl std::fmt::Debug for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointState")
            .field("writable", &self.writable)
            .field("readables", &self.readables)
            .field("readables_available", &self.readables_available)
            .field("callbacks_len", &self.callbacks.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct ShardEndpoint {
    pub endpoint: Endpoint,
    pool: Weak<DatabasePool>,
    context: Weak<DataPlane>,
    config: Arc<DataPlaneConfig>,
    finished: AtomicBool,
    locked: AtomicBool,
    /// Revision of the underlying writable index; 0 for remote endpoints.
    pub local_revision: AtomicU64,
    renew_time: Mutex<Instant>,
    state: Mutex<EndpointState>,
    writable_cond: Condvar,
    readables_cond: Condvar,
}

impl ShardEndpoint {
    fn new(pool: &Arc<DatabasePool>, endpoint: Endpoint) -> Arc<ShardEndpoint> {
        Arc::new(ShardEndpoint {
            endpoint,
            pool: Arc::downgrade(pool),
            context: pool.context.clone(),
            config: Arc::clone(&pool.config),
            finished: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            local_revision: AtomicU64::new(0),
            renew_time: Mutex::new(Instant::now()),
            state: Mutex::new(EndpointState {
                writable: None,
                readables: Vec::new(),
                readables_available: 0,
                callbacks: VecDeque::new(),
            }),
            writable_cond: Condvar::new(),
            readables_cond: Condvar::new(),
        })
    }

    pub fn config(&self) -> &Arc<DataPlaneConfig> {
        &self.config
    }

    pub fn context(&self) -> Weak<DataPlane> {
        self.context.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn not_available(
        &self,
        state: &mut EndpointState,
        callback: &mut Option<CheckinCallback>,
    ) -> Error {
        if let Some(cb) = callback.take() {
            state.callbacks.push_back(cb);
        }
        Error::NotAvailable(format!("shard is not available: {}", self.endpoint))
    }

    pub fn checkout(
        self: &Arc<Self>,
        flags: OpenFlags,
        timeout: Timeout,
        callback: Option<CheckinCallback>,
    ) -> Result<Arc<Shard>> {
        let deadline = match timeout {
            Timeout::After(duration) => Some(Instant::now() + duration),
            _ => None,
        };
        if flags.is_writable() {
            self.writable_checkout(flags, timeout, deadline, callback)
        } else {
            let shard = self.readable_checkout(flags, timeout, deadline, callback)?;
            Ok(self.refresh_stale_readable(shard, flags))
        }
    }

    fn writable_checkout(
        self: &Arc<Self>,
        flags: OpenFlags,
        timeout: Timeout,
        deadline: Option<Instant>,
        mut callback: Option<CheckinCallback>,
    ) -> Result<Arc<Shard>> {
        let mut state = self.state.lock();
        let mut expired = false;
        loop {
            if self.is_finished() {
                return Err(self.not_available(&mut state, &mut callback));
            }
            if state.writable.is_none() {
                state.writable = Some(Shard::new(Arc::clone(self), flags));
            }
            let writable = Arc::clone(state.writable.as_ref().unwrap());
            if !self.is_locked() && !writable.busy_swap(true) {
                writable.set_flags(flags);
                return Ok(writable);
            }
            if expired {
                return Err(self.not_available(&mut state, &mut callback));
            }
            match timeout {
                Timeout::Immediate => expired = true,
                Timeout::After(_) => {
                    if self
                        .writable_cond
                        .wait_until(&mut state, deadline.unwrap())
                        .timed_out()
                    {
                        expired = true;
                    }
                }
                Timeout::Forever => {
                    self.writable_cond
                        .wait_for(&mut state, Duration::from_secs(1));
                }
            }
        }
    }

    fn readable_checkout(
        self: &Arc<Self>,
        flags: OpenFlags,
        timeout: Timeout,
        deadline: Option<Instant>,
        mut callback: Option<CheckinCallback>,
    ) -> Result<Arc<Shard>> {
        let mut state = self.state.lock();
        let mut expired = false;
        loop {
            if self.is_finished() {
                return Err(self.not_available(&mut state, &mut callback));
            }
            if !self.is_locked() {
                if state.readables_available > 0 {
                    let mut acquired = None;
                    for readable in &state.readables {
                        if !readable.busy_swap(true) {
                            acquired = Some(Arc::clone(readable));
                            break;
                        }
                    }
                    if let Some(shard) = acquired {
                        shard.set_flags(flags);
                        state.readables_available -= 1;
                        return Ok(shard);
                    }
                }
                if state.readables.len() < self.config.max_database_readers {
                    let shard = Shard::new(Arc::clone(self), flags);
                    state.readables.push(Arc::clone(&shard));
                    if !shard.busy_swap(true) {
                        shard.set_flags(flags);
                        return Ok(shard);
                    }
                    state.readables_available += 1;
                }
            }
            if expired {
                return Err(self.not_available(&mut state, &mut callback));
            }
            match timeout {
                Timeout::Immediate => expired = true,
                Timeout::After(_) => {
                    if self
                        .readables_cond
                        .wait_until(&mut state, deadline.unwrap())
                        .timed_out()
                    {
                        expired = true;
                    }
                }
                Timeout::Forever => {
                    self.readables_cond
                        .wait_for(&mut state, Duration::from_secs(1));
                }
            }
        }
    }

    /// Replaces an outdated readable shard with a fresh one; the old one is
    /// dropped on the floor for its other holders to release.
    fn refresh_stale_readable(self: &Arc<Self>, shard: Arc<Shard>, flags: OpenFlags) -> Arc<Shard> {
        let staleness = || -> Result<bool> {
            let age = shard.reopen_time().elapsed();
            if age >= Duration::from_secs(self.config.local_update_interval_secs) {
                tracing::debug!(endpoint = %self.endpoint, "readable shard is too old");
                return Ok(true);
            }
            if shard.is_local() {
                let revision = self.local_revision.load(Ordering::Acquire);
                if revision != 0 && revision != shard.db_revision()? {
                    tracing::debug!(endpoint = %self.endpoint, "writable shard has advanced");
                    return Ok(true);
                }
            } else if age >= Duration::from_secs(self.config.remote_update_interval_secs) {
                tracing::debug!(endpoint = %self.endpoint, "remote readable shard is too old");
                return Ok(true);
            }
            Ok(false)
        };

        match staleness() {
            Ok(false) => shard,
            Ok(true) => {
                let fresh = Shard::new(Arc::clone(self), flags);
                fresh.busy_swap(true);
                let mut state = self.state.lock();
                match state.readables.iter_mut().find(|s| Arc::ptr_eq(s, &shard)) {
                    Some(slot) => *slot = Arc::clone(&fresh),
                    None => state.readables.push(Arc::clone(&fresh)),
                }
                fresh
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "readable shard refresh failed");
                shard
            }
        }
    }

    /// Returns a shard to the endpoint. Never fails; the busy flag is
    /// cleared last so waiters observe a consistent free set.
    pub fn checkin(&self, shard: &Arc<Shard>) {
        debug_assert!(shard.is_busy());

        let callbacks: Vec<CheckinCallback> = {
            let mut state = self.state.lock();
            state.callbacks.drain(..).collect()
        };

        let pool = self.pool.upgrade();
        let lock_waited = pool
            .as_ref()
            .map_or(false, |pool| pool.notify_lockable(self));

        if shard.is_writable() {
            if self.is_finished() || lock_waited || shard.is_closed() {
                let mut state = self.state.lock();
                if state
                    .writable
                    .as_ref()
                    .map_or(false, |w| Arc::ptr_eq(w, shard))
                {
                    state.writable = None;
                }
                drop(state);
                if let Some(pool) = &pool {
                    pool.notify_clears();
                }
            } else {
                Shard::autocommit(shard);
            }
            shard.release_busy();
            self.writable_cond.notify_one();
        } else {
            if self.is_finished() || lock_waited || shard.is_closed() {
                let mut state = self.state.lock();
                if let Some(pos) = state.readables.iter().position(|s| Arc::ptr_eq(s, shard)) {
                    state.readables.remove(pos);
                }
                drop(state);
                if let Some(pool) = &pool {
                    pool.notify_clears();
                }
            } else {
                self.state.lock().readables_available += 1;
            }
            shard.release_busy();
            self.readables_cond.notify_one();
        }

        for callback in callbacks {
            callback();
        }
    }

    /// Sticky: wakes all waiters, which then fail fast.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        let _state = self.state.lock();
        self.writable_cond.notify_all();
        self.readables_cond.notify_all();
    }

    /// Tears down idle shards. Returns the (writable, readable) counts
    /// still present afterwards.
    pub fn clear(&self) -> (usize, usize) {
        let writable = self.state.lock().writable.clone();
        if let Some(shard) = writable {
            if !shard.busy_swap(true) {
                shard.do_close_quiet(true);
                let weak = {
                    let mut state = self.state.lock();
                    state.writable = None;
                    Arc::downgrade(&shard)
                };
                drop(shard);
                if let Some(still_held) = weak.upgrade() {
                    still_held.release_busy();
                    self.state.lock().writable = Some(still_held);
                }
            }
        }

        let readables = self.state.lock().readables.clone();
        for shard in readables {
            if !shard.busy_swap(true) {
                shard.do_close_quiet(true);
                let weak = {
                    let mut state = self.state.lock();
                    if let Some(pos) = state.readables.iter().position(|s| Arc::ptr_eq(s, &shard))
                    {
                        state.readables.remove(pos);
                        state.readables_available = state.readables_available.saturating_sub(1);
                    }
                    Arc::downgrade(&shard)
                };
                drop(shard);
                if let Some(still_held) = weak.upgrade() {
                    still_held.release_busy();
                    let mut state = self.state.lock();
                    state.readables.push(still_held);
                    state.readables_available += 1;
                }
            }
        }

        self.count()
    }

    pub fn count(&self) -> (usize, usize) {
        let state = self.state.lock();
        (usize::from(state.writable.is_some()), state.readables.len())
    }

    /// `internal_refs` is the number of Arcs the caller knows are held by
    /// pool bookkeeping rather than by users.
    pub fn is_used(self: &Arc<Self>, internal_refs: usize) -> bool {
        if Arc::strong_count(self) > internal_refs || self.is_locked() {
            return true;
        }
        let (writable, readables) = self.count();
        writable + readables > 0
    }

    pub fn renew(&self) {
        *self.renew_time.lock() = Instant::now();
    }

    fn renewed_at(&self) -> Instant {
        *self.renew_time.lock()
    }
}

pub struct DatabasePool {
    context: Weak<DataPlane>,
    config: Arc<DataPlaneConfig>,
    lru: Mutex<LruMap<Endpoint, Arc<ShardEndpoint>>>,
    locks: AtomicUsize,
    wait_mtx: Mutex<()>,
    lockers_cond: Condvar,
    clears_cond: Condvar,
}

impl DatabasePool {
    pub fn new(config: Arc<DataPlaneConfig>, context: Weak<DataPlane>) -> Arc<DatabasePool> {
        let pool_size = config.database_pool_size;
        Arc::new(DatabasePool {
            context,
            config,
            lru: Mutex::new(LruMap::new(pool_size)),
            locks: AtomicUsize::new(0),
            wait_mtx: Mutex::new(()),
            lockers_cond: Condvar::new(),
            clears_cond: Condvar::new(),
        })
    }

    /// Finds or creates the endpoint broker, renewing its LRU position.
    pub fn spawn(self: &Arc<Self>, endpoint: &Endpoint) -> Arc<ShardEndpoint> {
        let mut lru = self.lru.lock();
        if let Some(existing) = lru.get(endpoint) {
            existing.renew();
            return Arc::clone(existing);
        }
        let created = ShardEndpoint::new(self, endpoint.clone());
        lru.insert(endpoint.clone(), Arc::clone(&created));
        created
    }

    /// Lookup without renewing or creating.
    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<ShardEndpoint>> {
        self.lru.lock().peek(endpoint).cloned()
    }

    pub fn checkout(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        flags: OpenFlags,
        timeout: Timeout,
        callback: Option<CheckinCallback>,
    ) -> Result<Arc<Shard>> {
        self.spawn(endpoint).checkout(flags, timeout, callback)
    }

    /// All-or-nothing fan-out: on any failure every already-acquired shard
    /// is checked back in before the error surfaces.
    pub fn checkout_endpoints(
        self: &Arc<Self>,
        endpoints: &Endpoints,
        flags: OpenFlags,
        timeout: Timeout,
    ) -> Result<Vec<Arc<Shard>>> {
        if endpoints.is_empty() {
            return Err(Error::Opening("cannot checkout empty endpoint list".into()));
        }
        let mut shards = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter() {
            match self.checkout(endpoint, flags, timeout, None) {
                Ok(shard) => shards.push(shard),
                Err(e) => {
                    self.checkin_shards(&mut shards);
                    return Err(e);
                }
            }
        }
        Ok(shards)
    }

    pub fn checkin(&self, shard: &Arc<Shard>) {
        shard.endpoint().checkin(shard);
    }

    /// Never surfaces errors; shards are forcibly freed to avoid leaks.
    pub fn checkin_shards(&self, shards: &mut Vec<Arc<Shard>>) {
        for shard in shards.drain(..) {
            shard.endpoint().checkin(&shard);
        }
    }

    /// Grants exclusive access to a local writable endpoint by setting
    /// `locked` and draining all readable holders.
    pub fn lock(&self, shard: &Arc<Shard>, timeout: Timeout) -> Result<()> {
        if !shard.is_writable() || !shard.is_local() {
            return Err(Error::InvalidArgument(
                "exclusive lock requires a local writable shard".into(),
            ));
        }
        let endpoint = shard.endpoint();

        self.locks.fetch_add(1, Ordering::AcqRel);
        if endpoint.locked.swap(true, Ordering::AcqRel) {
            self.locks.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::NotAvailable(
                "endpoint is already exclusively locked".into(),
            ));
        }

        let deadline = match timeout {
            Timeout::After(duration) => Some(Instant::now() + duration),
            _ => None,
        };
        loop {
            let (_, readables) = endpoint.clear();
            if readables == 0 {
                return Ok(());
            }
            let failed = match timeout {
                Timeout::Immediate => true,
                Timeout::After(_) => {
                    let mut guard = self.wait_mtx.lock();
                    self.lockers_cond
                        .wait_until(&mut guard, deadline.unwrap())
                        .timed_out()
                }
                Timeout::Forever => {
                    let mut guard = self.wait_mtx.lock();
                    self.lockers_cond
                        .wait_for(&mut guard, Duration::from_secs(1));
                    endpoint.is_finished()
                }
            };
            if failed {
                endpoint.locked.store(false, Ordering::Release);
                self.locks.fetch_sub(1, Ordering::AcqRel);
                let _state = endpoint.state.lock();
                endpoint.readables_cond.notify_all();
                endpoint.writable_cond.notify_all();
                return Err(Error::NotAvailable(
                    "cannot grant exclusive shard lock".into(),
                ));
            }
        }
    }

    pub fn unlock(&self, shard: &Arc<Shard>) -> Result<()> {
        if !shard.is_writable() || !shard.is_local() {
            return Err(Error::InvalidArgument(
                "exclusive lock requires a local writable shard".into(),
            ));
        }
        let endpoint = shard.endpoint();
        if !endpoint.locked.swap(false, Ordering::AcqRel) {
            return Err(Error::InvalidArgument(
                "endpoint is not exclusively locked".into(),
            ));
        }
        self.locks.fetch_sub(1, Ordering::AcqRel);
        let state = endpoint.state.lock();
        endpoint.readables_cond.notify_all();
        endpoint.writable_cond.notify_all();
        drop(state);
        Ok(())
    }

    /// Wakes an exclusive-lock waiter if this endpoint holds one. Called
    /// on every checkin so draining makes progress.
    pub fn notify_lockable(&self, endpoint: &ShardEndpoint) -> bool {
        if self.locks.load(Ordering::Acquire) > 0 && endpoint.is_locked() {
            let _guard = self.wait_mtx.lock();
            self.lockers_cond.notify_all();
            true
        } else {
            false
        }
    }

    pub fn is_locking(&self, endpoint: &ShardEndpoint) -> bool {
        self.locks.load(Ordering::Acquire) > 0 && endpoint.is_locked()
    }

    fn notify_clears(&self) {
        let _guard = self.wait_mtx.lock();
        self.clears_cond.notify_all();
    }

    /// Evicts unused endpoints past their TTL; `immediate` forces the TTL
    /// check. Referenced endpoints are never evicted.
    pub fn cleanup(&self, immediate: bool) {
        let now = Instant::now();
        let overflow_ttl = Duration::from_secs(self.config.endpoint_overflow_ttl_secs);
        let idle_ttl = Duration::from_secs(self.config.endpoint_idle_ttl_secs);

        let mut candidates: Vec<(Endpoint, Arc<ShardEndpoint>)> = Vec::new();
        {
            let mut lru = self.lru.lock();
            lru.trim(|key, value, overflowed| {
                let ttl = if overflowed { overflow_ttl } else { idle_ttl };
                if immediate || value.renewed_at() + ttl < now {
                    candidates.push((key.clone(), Arc::clone(value)));
                    DropAction::Leave
                } else if overflowed {
                    DropAction::Leave
                } else {
                    DropAction::Stop
                }
            });
        }

        for (_, endpoint) in &candidates {
            endpoint.clear();
        }

        let mut lru = self.lru.lock();
        for (key, endpoint) in candidates {
            // Two bookkeeping Arcs: the LRU's and this candidate list's.
            if !endpoint.is_used(2) {
                tracing::debug!(endpoint = %key, "evicting idle endpoint");
                lru.remove(&key);
            }
        }
    }

    /// Cascades `finished` to every endpoint.
    pub fn finish(&self) {
        let endpoints: Vec<Arc<ShardEndpoint>> =
            self.lru.lock().iter().map(|(_, v)| Arc::clone(v)).collect();
        for endpoint in endpoints {
            endpoint.finish();
        }
    }

    /// Blocks until every shard has been reclaimed, bounded by `deadline`.
    pub fn join(&self, deadline: Instant) -> bool {
        loop {
            if self.clear_all() {
                return true;
            }
            let mut guard = self.wait_mtx.lock();
            if self
                .clears_cond
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                drop(guard);
                return self.clear_all();
            }
        }
    }

    /// Attempts to drop every idle shard everywhere; true when nothing is
    /// left.
    pub fn clear_all(&self) -> bool {
        let endpoints: Vec<Arc<ShardEndpoint>> =
            self.lru.lock().iter().map(|(_, v)| Arc::clone(v)).collect();
        let mut cleared = true;
        for endpoint in &endpoints {
            let (writable, readables) = endpoint.clear();
            if writable + readables > 0 {
                cleared = false;
            }
        }
        if !cleared {
            return false;
        }

        let mut lru = self.lru.lock();
        for (_, endpoint) in lru.iter() {
            let (writable, readables) = endpoint.count();
            if writable + readables > 0 {
                return false;
            }
        }
        lru.clear();
        true
    }

    /// (endpoint count, shard count across all endpoints).
    pub fn count(&self) -> (usize, usize) {
        let endpoints: Vec<Arc<ShardEndpoint>> =
            self.lru.lock().iter().map(|(_, v)| Arc::clone(v)).collect();
        let mut shards = 0;
        for endpoint in &endpoints {
            let (writable, readables) = endpoint.count();
            shards += writable + readables;
        }
        (endpoints.len(), shards)
    }
}

#[cfg(test)]
mod tests;
