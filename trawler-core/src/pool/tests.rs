use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use super::*;
use crate::config::DataPlaneConfig;

fn engine() -> Arc<DataPlane> {
    DataPlane::new(DataPlaneConfig::default())
}

fn engine_with(config: DataPlaneConfig) -> Arc<DataPlane> {
    DataPlane::new(config)
}

fn writable_flags() -> OpenFlags {
    OpenFlags::WRITABLE | OpenFlags::CREATE_OR_OPEN
}

#[test]
fn checkout_vends_at_most_one_writable() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let first = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    assert!(first.is_busy());

    let err = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));

    ctx.pool.checkin(&first);
    let second = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    ctx.pool.checkin(&second);
}

#[test]
fn blocked_checkout_wakes_on_checkin() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let held = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();

    let ctx2 = Arc::clone(&ctx);
    let endpoint2 = endpoint.clone();
    let waiter = std::thread::spawn(move || {
        ctx2.pool
            .checkout(
                &endpoint2,
                writable_flags(),
                Timeout::After(Duration::from_secs(5)),
                None,
            )
            .map(|shard| {
                ctx2.pool.checkin(&shard);
            })
    });

    std::thread::sleep(Duration::from_millis(100));
    ctx.pool.checkin(&held);
    waiter.join().unwrap().unwrap();
}

#[test]
fn concurrent_writers_serialize() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..8 {
        let ctx = Arc::clone(&ctx);
        let endpoint = endpoint.clone();
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        threads.push(std::thread::spawn(move || {
            for _ in 0..20 {
                let shard = ctx
                    .pool
                    .checkout(
                        &endpoint,
                        writable_flags(),
                        Timeout::After(Duration::from_secs(10)),
                        None,
                    )
                    .unwrap();
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(200));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                ctx.pool.checkin(&shard);
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1, "writable shard was shared");
}

#[test]
fn readables_grow_up_to_the_cap() {
    let dir = TempDir::new().unwrap();
    let ctx = engine_with(DataPlaneConfig {
        max_database_readers: 2,
        ..DataPlaneConfig::default()
    });
    let endpoint = Endpoint::local(dir.path().join("db"));

    // Create the index first.
    let writer = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    writer.db_revision().unwrap();
    ctx.pool.checkin(&writer);

    let r1 = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap();
    let r2 = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap();
    let err = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));

    ctx.pool.checkin(&r1);
    let r3 = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap();
    ctx.pool.checkin(&r2);
    ctx.pool.checkin(&r3);

    let spawned = ctx.pool.get(&endpoint).unwrap();
    let (writables, readables) = spawned.count();
    assert_eq!(writables, 1);
    assert!(readables <= 2);
}

#[test]
fn finished_endpoint_rejects_checkouts() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let spawned = ctx.pool.spawn(&endpoint);
    spawned.finish();

    let err = ctx
        .pool
        .checkout(
            &endpoint,
            writable_flags(),
            Timeout::After(Duration::from_secs(5)),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));
}

#[test]
fn failed_checkout_callback_runs_on_checkin() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let held = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let callback_fired = Arc::clone(&fired);
    let err = ctx
        .pool
        .checkout(
            &endpoint,
            writable_flags(),
            Timeout::Immediate,
            Some(Box::new(move || {
                callback_fired.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    ctx.pool.checkin(&held);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn exclusive_lock_drains_and_blocks() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let writer = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    writer.db_revision().unwrap(); // open it so it counts as local
    let reader = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap();

    // Locking waits for the reader to come back.
    let ctx2 = Arc::clone(&ctx);
    let writer2 = Arc::clone(&writer);
    let locker = std::thread::spawn(move || {
        ctx2.pool
            .lock(&writer2, Timeout::After(Duration::from_secs(5)))
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(!locker.is_finished());
    ctx.pool.checkin(&reader);
    locker.join().unwrap().unwrap();

    // While locked, checkouts fail within their deadline.
    let start = Instant::now();
    let err = ctx
        .pool
        .checkout(
            &endpoint,
            writable_flags(),
            Timeout::After(Duration::from_millis(500)),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::NotAvailable(_)));
    assert!(start.elapsed() < Duration::from_millis(700));

    ctx.pool.unlock(&writer).unwrap();
    let unlocked = ctx
        .pool
        .checkout(
            &endpoint,
            OpenFlags::OPEN,
            Timeout::After(Duration::from_secs(2)),
            None,
        )
        .unwrap();
    ctx.pool.checkin(&unlocked);
    ctx.pool.checkin(&writer);
}

#[test]
fn lock_requires_local_writable() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let writer = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    writer.db_revision().unwrap();
    let reader = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap();

    assert!(matches!(
        ctx.pool.lock(&reader, Timeout::Immediate),
        Err(Error::InvalidArgument(_))
    ));
    ctx.pool.checkin(&reader);
    ctx.pool.checkin(&writer);
}

#[test]
fn cleanup_never_evicts_used_endpoints() {
    let dir = TempDir::new().unwrap();
    let ctx = engine_with(DataPlaneConfig {
        endpoint_idle_ttl_secs: 0,
        endpoint_overflow_ttl_secs: 0,
        ..DataPlaneConfig::default()
    });

    let used = Endpoint::local(dir.path().join("used"));
    let idle = Endpoint::local(dir.path().join("idle"));

    let shard = ctx
        .pool
        .checkout(&used, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    ctx.pool.spawn(&idle);

    ctx.pool.cleanup(true);

    assert!(ctx.pool.get(&used).is_some(), "used endpoint was evicted");
    assert!(ctx.pool.get(&idle).is_none(), "idle endpoint survived");
    ctx.pool.checkin(&shard);
}

#[test]
fn finish_and_join_reclaim_everything() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    shard.db_revision().unwrap();

    ctx.pool.finish();
    let ctx2 = Arc::clone(&ctx);
    let shard2 = Arc::clone(&shard);
    let holder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        ctx2.pool.checkin(&shard2);
    });
    drop(shard);

    assert!(ctx.pool.join(Instant::now() + Duration::from_secs(5)));
    holder.join().unwrap();
    let (endpoints, shards) = ctx.pool.count();
    assert_eq!((endpoints, shards), (0, 0));
}

#[test]
fn timeout_semantics_from_seconds() {
    assert!(matches!(Timeout::from_secs_f64(-1.0), Timeout::Forever));
    assert!(matches!(Timeout::from_secs_f64(0.0), Timeout::Immediate));
    assert!(matches!(Timeout::from_secs_f64(0.5), Timeout::After(_)));
}
