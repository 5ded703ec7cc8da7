//! Time-ordered task queue feeding one or more worker threads.
//!
//! Tasks fire at most once: clearing is a CAS on `cleared_at`, so a task
//! cancelled while queued is skipped when the scheduler walks past it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

fn anchor() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Nanoseconds since process start; the scheduler's clock.
pub fn now_nanos() -> u64 {
    anchor().elapsed().as_nanos() as u64
}

pub fn instant_for(nanos: u64) -> Instant {
    anchor() + Duration::from_nanos(nanos)
}

/// Slots older than this are dropped by `clean`.
const CLEAN_AGE: Duration = Duration::from_secs(60);

pub struct ScheduledTask {
    wakeup_time: AtomicU64,
    created_at: u64,
    cleared_at: AtomicU64,
    run: Box<dyn Fn() + Send + Sync>,
}

impl ScheduledTask {
    pub fn new(run: impl Fn() + Send + Sync + 'static) -> Arc<ScheduledTask> {
        Arc::new(ScheduledTask {
            wakeup_time: AtomicU64::new(0),
            created_at: now_nanos(),
            cleared_at: AtomicU64::new(0),
            run: Box::new(run),
        })
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn wakeup_time(&self) -> u64 {
        self.wakeup_time.load(Ordering::Acquire)
    }

    pub fn set_wakeup_time(&self, nanos: u64) {
        self.wakeup_time.store(nanos, Ordering::Release);
    }

    /// Still pending (not yet run, not cancelled).
    pub fn is_pending(&self) -> bool {
        self.cleared_at.load(Ordering::Acquire) == 0
    }

    /// At-most-once latch; the winner of the CAS owns the task.
    pub fn clear(&self) -> bool {
        self.cleared_at
            .compare_exchange(0, now_nanos().max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn execute(&self) {
        (self.run)();
    }
}

/// Wakeup-time bucketed queue.
#[derive(Default)]
struct SchedulerQueue {
    slots: Mutex<BTreeMap<u64, Vec<Arc<ScheduledTask>>>>,
}

impl SchedulerQueue {
    fn add(&self, task: Arc<ScheduledTask>) {
        let mut slots = self.slots.lock();
        slots.entry(task.wakeup_time()).or_default().push(task);
    }

    /// Earliest pending wakeup at or before `end`, without consuming.
    fn peep(&self, end: u64) -> Option<u64> {
        let slots = self.slots.lock();
        for (wakeup, tasks) in slots.iter() {
            if *wakeup > end {
                break;
            }
            if tasks.iter().any(|t| t.is_pending()) {
                return Some(*wakeup);
            }
        }
        None
    }

    /// Pops the earliest due task.
    fn walk(&self, now: u64) -> Option<Arc<ScheduledTask>> {
        let mut slots = self.slots.lock();
        loop {
            let (&wakeup, _) = slots.iter().next()?;
            if wakeup > now {
                return None;
            }
            let tasks = slots.get_mut(&wakeup).unwrap();
            let task = tasks.pop();
            if tasks.is_empty() {
                slots.remove(&wakeup);
            }
            match task {
                Some(task) => return Some(task),
                None => continue,
            }
        }
    }

    /// Drops fully-consumed slots older than a minute.
    fn clean(&self, now: u64) {
        let cutoff = now.saturating_sub(CLEAN_AGE.as_nanos() as u64);
        let mut slots = self.slots.lock();
        slots.retain(|wakeup, tasks| {
            if *wakeup >= cutoff {
                return true;
            }
            tasks.retain(|t| t.is_pending());
            !tasks.is_empty()
        });
    }
}

struct PoolShared {
    queue: Mutex<VecDeque<Arc<ScheduledTask>>>,
    available: Condvar,
    ending: AtomicBool,
}

/// Fixed-size worker pool for the threaded scheduler flavor.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: &str, num_threads: usize) -> ThreadPool {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            ending: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || loop {
                    let task = {
                        let mut queue = shared.queue.lock();
                        loop {
                            if let Some(task) = queue.pop_front() {
                                break task;
                            }
                            if shared.ending.load(Ordering::Acquire) {
                                return;
                            }
                            shared.available.wait(&mut queue);
                        }
                    };
                    task.execute();
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        ThreadPool {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn enqueue(&self, task: Arc<ScheduledTask>) {
        if self.shared.ending.load(Ordering::Acquire) {
            return;
        }
        self.shared.queue.lock().push_back(task);
        self.shared.available.notify_one();
    }

    pub fn finish(&self) {
        self.shared.ending.store(true, Ordering::Release);
        self.shared.available.notify_all();
    }

    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut workers = self.workers.lock();
        while let Some(handle) = workers.pop() {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    workers.push(handle);
                    return false;
                }
                thread::sleep(Duration::from_millis(10));
            }
            let _ = handle.join();
        }
        true
    }
}

struct SchedulerShared {
    queue: SchedulerQueue,
    mtx: Mutex<()>,
    wakeup_signal: Condvar,
    next_wakeup: AtomicU64,
    ending: AtomicBool,
    pool: Option<ThreadPool>,
}

/// The scheduler thread peeps the nearest due time, sleeps until then (or
/// a notify), then walks all due tasks handing each to the worker pool, or
/// running it inline for the non-threaded flavor.
pub struct Scheduler {
    name: String,
    shared: Arc<SchedulerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// `num_threads == 0` selects the inline flavor.
    pub fn new(name: impl Into<String>, num_threads: usize) -> Arc<Scheduler> {
        let name = name.into();
        let shared = Arc::new(SchedulerShared {
            queue: SchedulerQueue::default(),
            mtx: Mutex::new(()),
            wakeup_signal: Condvar::new(),
            next_wakeup: AtomicU64::new(u64::MAX),
            ending: AtomicBool::new(false),
            pool: (num_threads > 0).then(|| ThreadPool::new(&name, num_threads)),
        });

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{name}-scheduler"))
            .spawn(move || scheduler_loop(loop_shared))
            .expect("failed to spawn scheduler thread");

        Arc::new(Scheduler {
            name,
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, task: Arc<ScheduledTask>, wakeup: u64) {
        if self.shared.ending.load(Ordering::Acquire) {
            return;
        }
        let wakeup = wakeup.max(now_nanos());
        task.set_wakeup_time(wakeup);
        self.shared.queue.add(task);

        let mut next = self.shared.next_wakeup.load(Ordering::Acquire);
        while wakeup < next {
            match self.shared.next_wakeup.compare_exchange_weak(
                next,
                wakeup,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => next = observed,
            }
        }
        if wakeup <= next {
            let _guard = self.shared.mtx.lock();
            self.shared.wakeup_signal.notify_one();
        }
    }

    pub fn finish(&self) {
        self.shared.ending.store(true, Ordering::Release);
        {
            let _guard = self.shared.mtx.lock();
            self.shared.wakeup_signal.notify_all();
        }
        if let Some(pool) = &self.shared.pool {
            pool.finish();
        }
    }

    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if let Some(handle) = self.thread.lock().take() {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    *self.thread.lock() = Some(handle);
                    return false;
                }
                thread::sleep(Duration::from_millis(10));
            }
            let _ = handle.join();
        }
        if let Some(pool) = &self.shared.pool {
            let remaining = deadline.saturating_duration_since(Instant::now());
            return pool.join(remaining.max(Duration::from_millis(10)));
        }
        true
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.finish();
        self.join(Duration::from_secs(1));
    }
}

fn scheduler_loop(shared: Arc<SchedulerShared>) {
    loop {
        if shared.ending.load(Ordering::Acquire) {
            break;
        }

        let now = now_nanos();
        let mut wakeup = now + Duration::from_secs(30).as_nanos() as u64;
        if let Some(peeped) = shared.queue.peep(wakeup) {
            if peeped < wakeup {
                wakeup = peeped;
            }
        }
        shared.next_wakeup.store(wakeup, Ordering::Release);

        {
            let mut guard = shared.mtx.lock();
            let next = shared.next_wakeup.load(Ordering::Acquire);
            if next > now_nanos() && !shared.ending.load(Ordering::Acquire) {
                shared
                    .wakeup_signal
                    .wait_until(&mut guard, instant_for(next));
            }
        }

        let now = now_nanos();
        while let Some(task) = shared.queue.walk(now) {
            // The CAS guarantees a cleared task never executes.
            if task.clear() {
                match &shared.pool {
                    Some(pool) => pool.enqueue(task),
                    None => task.execute(),
                }
            }
        }
        shared.queue.clean(now);
    }
}
