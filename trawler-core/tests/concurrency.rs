//! Concurrency scenarios: single-writer discipline, exclusive locks and
//! shutdown under contention.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use trawler_core::backend::Document;
use trawler_core::config::DataPlaneConfig;
use trawler_core::endpoint::Endpoint;
use trawler_core::engine::DataPlane;
use trawler_core::pool::Timeout;
use trawler_core::storage::Data;
use trawler_core::{Error, OpenFlags};

fn engine() -> Arc<DataPlane> {
    DataPlane::new(DataPlaneConfig::default())
}

fn writable_flags() -> OpenFlags {
    OpenFlags::WRITABLE | OpenFlags::CREATE_OR_OPEN
}

#[test]
fn single_writer_under_contention() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let writing = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for t in 0..6 {
        let ctx = Arc::clone(&ctx);
        let endpoint = endpoint.clone();
        let writing = Arc::clone(&writing);
        let violations = Arc::clone(&violations);
        let writes = Arc::clone(&writes);
        threads.push(std::thread::spawn(move || {
            for i in 0..10 {
                let shard = ctx
                    .pool
                    .checkout(
                        &endpoint,
                        writable_flags(),
                        Timeout::After(Duration::from_secs(10)),
                        None,
                    )
                    .unwrap();
                if writing.swap(true, Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }

                let term = format!("Qdoc/{t}/{i}");
                let mut doc = Document::new();
                doc.add_boolean_term(term.as_bytes().to_vec());
                let data = Data::from_obj(&serde_json::json!({"t": t, "i": i})).unwrap();
                doc.set_data(data.serialise());
                shard
                    .replace_document_term(term.as_bytes(), doc, false, true, false)
                    .unwrap();
                writes.fetch_add(1, Ordering::SeqCst);

                writing.store(false, Ordering::SeqCst);
                ctx.pool.checkin(&shard);
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0, "writable shard shared");
    assert_eq!(writes.load(Ordering::SeqCst), 60);

    // Everything written is there after a final commit.
    let shard = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    shard.commit(true, true).unwrap();
    for t in 0..6 {
        for i in 0..10 {
            let term = format!("Qdoc/{t}/{i}");
            assert!(shard.get_docid_term(term.as_bytes()).is_ok());
        }
    }
    ctx.pool.checkin(&shard);
}

#[test]
fn checkouts_fail_fast_while_locked_and_recover() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    // Thread A holds the writable shard and takes the exclusive lock.
    let writer = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    writer.db_revision().unwrap();
    ctx.pool
        .lock(&writer, Timeout::After(Duration::from_secs(2)))
        .unwrap();

    // Threads B..K all fail with NotAvailable within their deadline.
    let mut threads = Vec::new();
    for _ in 0..10 {
        let ctx = Arc::clone(&ctx);
        let endpoint = endpoint.clone();
        threads.push(std::thread::spawn(move || {
            let start = Instant::now();
            let result = ctx.pool.checkout(
                &endpoint,
                writable_flags(),
                Timeout::After(Duration::from_millis(500)),
                None,
            );
            (start.elapsed(), result)
        }));
    }
    for thread in threads {
        let (elapsed, result) = thread.join().unwrap();
        assert!(matches!(result, Err(Error::NotAvailable(_))));
        assert!(elapsed <= Duration::from_millis(600), "took {elapsed:?}");
    }

    // After unlock, retries succeed one at a time.
    ctx.pool.unlock(&writer).unwrap();
    ctx.pool.checkin(&writer);

    let mut threads = Vec::new();
    for _ in 0..10 {
        let ctx = Arc::clone(&ctx);
        let endpoint = endpoint.clone();
        threads.push(std::thread::spawn(move || {
            let shard = ctx
                .pool
                .checkout(
                    &endpoint,
                    writable_flags(),
                    Timeout::After(Duration::from_secs(10)),
                    None,
                )
                .unwrap();
            std::thread::sleep(Duration::from_millis(5));
            ctx.pool.checkin(&shard);
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }
}

#[test]
fn finish_aborts_waiters() {
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
        // Indefinite wait: only finish() can end it.
        ctx2.pool
            .checkout(&endpoint2, writable_flags(), Timeout::Forever, None)
    });

    std::thread::sleep(Duration::from_millis(100));
    ctx.pool.finish();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(Error::NotAvailable(_))));

    ctx.pool.checkin(&held);
    assert!(ctx.pool.join(Instant::now() + Duration::from_secs(5)));
}

#[test]
fn readers_see_committed_revisions() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let writer = ctx
        .pool
        .checkout(&endpoint, writable_flags(), Timeout::Immediate, None)
        .unwrap();
    let mut doc = Document::new();
    doc.add_boolean_term(b"Qfirst".to_vec());
    writer
        .replace_document_term(b"Qfirst", doc, true, true, false)
        .unwrap();

    let reader = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap();
    assert!(reader.get_docid_term(b"Qfirst").is_ok());
    ctx.pool.checkin(&reader);

    // A second write commits a newer revision; a fresh reader sees it
    // because the endpoint tracks the writable revision.
    let mut doc = Document::new();
    doc.add_boolean_term(b"Qsecond".to_vec());
    writer
        .replace_document_term(b"Qsecond", doc, true, true, false)
        .unwrap();
    ctx.pool.checkin(&writer);

    let reader = ctx
        .pool
        .checkout(&endpoint, OpenFlags::OPEN, Timeout::Immediate, None)
        .unwrap();
    assert!(reader.get_docid_term(b"Qsecond").is_ok());
    ctx.pool.checkin(&reader);
}
