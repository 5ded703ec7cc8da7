//! Keyed coalescer on top of the scheduler.
//!
//! Multiple `debounce(key, ...)` calls within a window collapse into a
//! single deferred invocation of the bound function. Repeated calls push
//! the wakeup out (busy timeout) up to an absolute force deadline; after a
//! firing, a throttler entry spaces out the next run.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::scheduler::{now_nanos, ScheduledTask, Scheduler};

#[derive(Debug, Clone, Copy)]
pub struct DebounceTimings {
    /// Minimum spacing between successive runs for the same key.
    pub throttle: Duration,
    /// Delay after the first request to fire.
    pub debounce: Duration,
    /// Delay when a prior request is still pending.
    pub busy: Duration,
    /// Absolute deadline past which a key must fire regardless.
    pub force: Duration,
}

impl DebounceTimings {
    pub fn from_millis(throttle: u64, debounce: u64, busy: u64, force: u64) -> DebounceTimings {
        DebounceTimings {
            throttle: Duration::from_millis(throttle),
            debounce: Duration::from_millis(debounce),
            busy: Duration::from_millis(busy),
            force: Duration::from_millis(force),
        }
    }
}

struct Status {
    task: Option<Arc<ScheduledTask>>,
    task_is_throttler: bool,
    /// Zero marks the entry as a throttling cool-down.
    max_wakeup_time: u64,
}

struct Inner<K, P> {
    scheduler: Arc<Scheduler>,
    statuses: Mutex<HashMap<K, Status>>,
    timings: DebounceTimings,
    func: Box<dyn Fn(K, P) + Send + Sync>,
}

pub struct Debouncer<K, P> {
    inner: Arc<Inner<K, P>>,
}

impl<K, P> Clone for Debouncer<K, P> {
    fn clone(&self) -> Self {
        Debouncer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P> Debouncer<K, P>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    pub fn new(
        name: &str,
        num_threads: usize,
        timings: DebounceTimings,
        func: impl Fn(K, P) + Send + Sync + 'static,
    ) -> Debouncer<K, P> {
        Debouncer {
            inner: Arc::new(Inner {
                scheduler: Scheduler::new(name, num_threads),
                statuses: Mutex::new(HashMap::new()),
                timings,
                func: Box::new(func),
            }),
        }
    }

    pub fn debounce(&self, key: K, payload: P) {
        self.delayed_debounce(Duration::ZERO, key, payload);
    }

    pub fn delayed_debounce(&self, delay: Duration, key: K, payload: P) {
        let inner = &self.inner;
        let now = now_nanos();
        let delay = delay.as_nanos() as u64;
        let force = inner.timings.force.as_nanos() as u64;

        {
            let mut statuses = inner.statuses.lock();
            let status = statuses.entry(key.clone()).or_insert_with(|| Status {
                task: None,
                task_is_throttler: false,
                max_wakeup_time: 0,
            });

            let mut next_wakeup = if status.task.is_none() && status.max_wakeup_time == 0 {
                // Fresh entry.
                status.max_wakeup_time = now + force + delay;
                now + inner.timings.debounce.as_nanos() as u64 + delay
            } else if status.max_wakeup_time != 0 {
                // A request is already pending; use the busy timeout.
                now + inner.timings.busy.as_nanos() as u64 + delay
            } else {
                // Entry is a throttling cool-down; re-arm it.
                status.max_wakeup_time = now + force + delay;
                now + inner.timings.debounce.as_nanos() as u64 + delay
            };
            if next_wakeup > status.max_wakeup_time {
                next_wakeup = status.max_wakeup_time;
            }

            if let Some(existing) = &status.task {
                if status.task_is_throttler {
                    // Never fire before the cool-down elapses.
                    if next_wakeup < existing.wakeup_time() {
                        next_wakeup = existing.wakeup_time();
                    }
                } else if next_wakeup <= existing.wakeup_time() {
                    // A task is already scheduled at least as late; keep it.
                    return;
                }
                existing.clear();
            }

            let task = self.make_task(key.clone(), payload);
            status.task = Some(Arc::clone(&task));
            status.task_is_throttler = false;
            inner.scheduler.add(task, next_wakeup);
        }
    }

    fn make_task(&self, key: K, payload: P) -> Arc<ScheduledTask> {
        let debouncer = self.clone();
        let payload = Mutex::new(Some(payload));
        ScheduledTask::new(move || {
            if let Some(payload) = payload.lock().take() {
                debouncer.throttle(&key);
                (debouncer.inner.func)(key.clone(), payload);
            }
        })
    }

    /// Installs a cool-down after a firing so runs for the same key are
    /// spaced at least `throttle` apart.
    fn throttle(&self, key: &K) {
        let inner = &self.inner;
        if inner.timings.throttle > inner.timings.debounce {
            let throttler = {
                let mut statuses = inner.statuses.lock();
                let status = match statuses.get_mut(key) {
                    Some(status) => status,
                    None => return,
                };
                status.max_wakeup_time = 0;

                let debouncer = self.clone();
                let throttle_key = key.clone();
                let task = ScheduledTask::new(move || {
                    debouncer.release(&throttle_key);
                });
                status.task = Some(Arc::clone(&task));
                status.task_is_throttler = true;
                task
            };
            let wakeup = now_nanos() + inner.timings.throttle.as_nanos() as u64;
            inner.scheduler.add(throttler, wakeup);
        } else {
            self.release(key);
        }
    }

    fn release(&self, key: &K) {
        self.inner.statuses.lock().remove(key);
    }

    pub fn finish(&self) {
        self.inner.scheduler.finish();
    }

    pub fn join(&self, timeout: Duration) -> bool {
        self.inner.scheduler.join(timeout)
    }
}
