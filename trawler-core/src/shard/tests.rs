use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::config::DataPlaneConfig;
use crate::endpoint::Endpoint;
use crate::engine::DataPlane;
use crate::pool::Timeout;
use crate::storage::{Data, Locator, STORED_BLOB};

fn engine() -> Arc<DataPlane> {
    DataPlane::new(DataPlaneConfig {
        committer_debounce_ms: 20,
        committer_debounce_busy_ms: 40,
        committer_force_ms: 200,
        committer_throttle_ms: 0,
        fsync_debounce_ms: 5,
        ..DataPlaneConfig::default()
    })
}

fn writable(ctx: &Arc<DataPlane>, endpoint: &Endpoint) -> Arc<Shard> {
    ctx.pool
        .checkout(
            endpoint,
            OpenFlags::WRITABLE | OpenFlags::CREATE_OR_OPEN,
            Timeout::After(Duration::from_secs(2)),
            None,
        )
        .unwrap()
}

fn readable(ctx: &Arc<DataPlane>, endpoint: &Endpoint) -> Arc<Shard> {
    ctx.pool
        .checkout(
            endpoint,
            OpenFlags::OPEN,
            Timeout::After(Duration::from_secs(2)),
            None,
        )
        .unwrap()
}

fn doc_with_obj(id_term: &[u8], obj: serde_json::Value) -> Document {
    let mut doc = Document::new();
    doc.add_boolean_term(id_term.to_vec());
    let data = Data::from_obj(&obj).unwrap();
    doc.set_data(data.serialise());
    doc
}

#[test]
fn write_commit_then_read_back() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    let doc = doc_with_obj(b"Qdoc/1", serde_json::json!({"msg": "hi"}));
    let did = shard
        .replace_document_term(b"Qdoc/1", doc, false, true, false)
        .unwrap();
    assert_eq!(did, 1);
    assert!(shard.is_modified());
    assert!(shard.commit(true, true).unwrap());
    assert!(!shard.is_modified());
    ctx.pool.checkin(&shard);

    let reader = readable(&ctx, &endpoint);
    let did = reader.get_docid_term(b"Qdoc/1").unwrap();
    let doc = reader.get_document(did).unwrap();
    let data = Data::from_serialised(doc.get_data()).unwrap();
    assert_eq!(data.get_obj().unwrap(), serde_json::json!({"msg": "hi"}));
    assert_eq!(doc.get_value(DB_SLOT_VERSION), sortable_serialise(1.0));
    ctx.pool.checkin(&reader);
}

#[test]
fn versions_increase_by_one_per_replace() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    for expected in 1..=3u32 {
        let doc = doc_with_obj(b"Qdoc/1", serde_json::json!({"rev": expected}));
        let did = shard
            .replace_document_term(b"Qdoc/1", doc, false, true, false)
            .unwrap();
        let stored = shard.get_document(did).unwrap();
        assert_eq!(
            stored.get_value(DB_SLOT_VERSION),
            sortable_serialise(f64::from(expected))
        );
        // Exactly one version term per document.
        let prefix = Shard::version_prefix(did);
        let stored_version = {
            let guard = shard.db.lock();
            Shard::stored_version(guard.as_ref().unwrap(), &prefix)
        };
        assert_eq!(stored_version, Some(sortable_serialise(f64::from(expected))));
    }
    ctx.pool.checkin(&shard);
}

#[test]
fn version_conflict_leaves_state_unchanged() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    let doc = doc_with_obj(b"Qdoc/1", serde_json::json!({"rev": 1}));
    let did = shard
        .replace_document_term(b"Qdoc/1", doc, false, true, false)
        .unwrap();

    // Stale caller-side version (0 instead of the stored 1).
    let mut stale = doc_with_obj(b"Qdoc/1", serde_json::json!({"rev": "stale"}));
    stale.add_value(DB_SLOT_VERSION, sortable_serialise(0.0));
    let err = shard
        .replace_document_term(b"Qdoc/1", stale, false, true, true)
        .unwrap_err();
    assert!(matches!(err, Error::VersionConflict(_)));

    let stored = shard.get_document(did).unwrap();
    let data = Data::from_serialised(stored.get_data()).unwrap();
    assert_eq!(data.get_obj().unwrap(), serde_json::json!({"rev": 1}));
    assert_eq!(stored.get_value(DB_SLOT_VERSION), sortable_serialise(1.0));

    // Delete with a wrong expected version refuses too.
    let err = shard
        .delete_document(did, false, true, Some(7))
        .unwrap_err();
    assert!(matches!(err, Error::VersionConflict(_)));
    assert!(shard.get_document(did).is_ok());
    ctx.pool.checkin(&shard);
}

#[test]
fn sentinel_id_gets_fresh_global_id() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    // Sentinel zero id with a shards hint of (shard 2 of 4).
    let mut doc = doc_with_obj(b"ignored", serde_json::json!({"_id": 0}));
    doc.add_value(DB_SLOT_SHARDS, serialise_shards_hint(2, 4));
    let mut term = b"QN".to_vec();
    term.extend_from_slice(&sortable_serialise(0.0));
    let shard_did = shard
        .replace_document_term(&term, doc, false, true, false)
        .unwrap();
    assert_eq!(shard_did, 1);

    let stored = shard.get_document(shard_did).unwrap();
    // global = (shard_did - 1) * n + shard_num + 1 = 3
    assert_eq!(
        stored.get_value(DB_SLOT_ID),
        sortable_serialise(3.0)
    );
    // The id was rewritten inside the data object and the hint cleared.
    let data = Data::from_serialised(stored.get_data()).unwrap();
    assert_eq!(data.get_obj().unwrap()["_id"], serde_json::json!(3));
    assert!(stored.get_value(DB_SLOT_SHARDS).is_empty());
    ctx.pool.checkin(&shard);
}

#[test]
fn wal_replays_missing_revisions() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let source = dir.path().join("db");
    let endpoint = Endpoint::local(source.clone());

    let shard = writable(&ctx, &endpoint);
    let mut mid_snapshot = Vec::new();
    for n in 1..=10u32 {
        let term = format!("Qdoc/{n}");
        let doc = doc_with_obj(term.as_bytes(), serde_json::json!({"n": n}));
        shard
            .replace_document_term(term.as_bytes(), doc, false, true, false)
            .unwrap();
        shard.commit(true, true).unwrap();
        if n == 5 {
            mid_snapshot = std::fs::read(source.join("index.bin")).unwrap();
        }
    }
    assert_eq!(shard.db_revision().unwrap(), 10);
    ctx.pool.checkin(&shard);

    // Copy the shard directory, then roll the backend back to revision 5
    // leaving the WAL intact.
    let copy = dir.path().join("copy");
    std::fs::create_dir_all(&copy).unwrap();
    for entry in std::fs::read_dir(&source).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), copy.join(entry.file_name())).unwrap();
    }
    std::fs::write(copy.join("index.bin"), &mid_snapshot).unwrap();

    let copy_endpoint = Endpoint::local(copy);
    let replayed = writable(&ctx, &copy_endpoint);
    assert_eq!(replayed.db_revision().unwrap(), 10);
    for n in 1..=10u32 {
        let term = format!("Qdoc/{n}");
        assert!(replayed.get_docid_term(term.as_bytes()).is_ok(), "doc {n} missing");
    }
    ctx.pool.checkin(&replayed);
}

#[test]
fn dirty_checkin_autocommits() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    let doc = doc_with_obj(b"Qdoc/1", serde_json::json!({"later": true}));
    shard
        .replace_document_term(b"Qdoc/1", doc, false, true, false)
        .unwrap();
    assert_eq!(shard.db_revision().unwrap(), 0);
    ctx.pool.checkin(&shard);

    // The committer should flush within its force window.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        let reader = readable(&ctx, &endpoint);
        let revision = reader.db_revision().unwrap();
        ctx.pool.checkin(&reader);
        if revision >= 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "autocommit never flushed"
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn blobs_round_trip_through_storage() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    let blob = vec![0xabu8; 4096];
    let mut data = Data::from_obj(&serde_json::json!({"name": "attachment"})).unwrap();
    data.update(Locator::stored_pending("image/png", blob.clone()));
    data.flush();
    let mut doc = Document::new();
    doc.add_boolean_term(b"Qdoc/1".to_vec());
    doc.set_data(data.serialise());

    let did = shard
        .replace_document_term(b"Qdoc/1", doc, true, true, false)
        .unwrap();

    let stored = shard.get_document(did).unwrap();
    let stored_data = Data::from_serialised(stored.get_data()).unwrap();
    let locator = stored_data.get("image/png").unwrap();
    assert!(locator.volume.is_some());
    assert!(locator.raw().is_empty());
    assert_eq!(locator.size as usize, blob.len());

    let record = shard.storage_get_stored(locator).unwrap();
    assert_eq!(
        crate::serialise::unserialise_string_at(STORED_BLOB, &record).unwrap(),
        blob
    );
    ctx.pool.checkin(&shard);
}

#[test]
fn transactions_can_cancel() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    let doc = doc_with_obj(b"Qkeep", serde_json::json!({"keep": true}));
    shard
        .replace_document_term(b"Qkeep", doc, true, true, false)
        .unwrap();

    shard.begin_transaction(false).unwrap();
    let doc = doc_with_obj(b"Qdrop", serde_json::json!({"drop": true}));
    shard
        .replace_document_term(b"Qdrop", doc, false, false, false)
        .unwrap();
    shard.cancel_transaction().unwrap();

    assert!(shard.get_docid_term(b"Qkeep").is_ok());
    assert!(matches!(
        shard.get_docid_term(b"Qdrop"),
        Err(Error::NotFound(_))
    ));
    ctx.pool.checkin(&shard);
}

#[test]
fn disabled_wal_writes_no_volumes() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let path = dir.path().join("db");
    let endpoint = Endpoint::local(path.clone());

    let shard = ctx
        .pool
        .checkout(
            &endpoint,
            OpenFlags::WRITABLE | OpenFlags::CREATE_OR_OPEN | OpenFlags::DISABLE_WAL,
            Timeout::After(Duration::from_secs(2)),
            None,
        )
        .unwrap();
    let doc = doc_with_obj(b"Qdoc/1", serde_json::json!({"x": 1}));
    shard
        .replace_document_term(b"Qdoc/1", doc, true, true, false)
        .unwrap();
    ctx.pool.checkin(&shard);

    assert!(crate::wal::DatabaseWal::volumes(&path).unwrap().is_empty());
}

#[test]
fn metadata_and_spelling_pass_through() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let shard = writable(&ctx, &endpoint);
    shard.set_metadata(b"schema", b"{}", false, true).unwrap();
    shard.add_spelling(b"trawler", 2, false, true).unwrap();
    assert_eq!(shard.remove_spelling(b"trawler", 1, false, true).unwrap(), 1);
    assert_eq!(shard.get_metadata(b"schema").unwrap(), b"{}".to_vec());
    assert_eq!(shard.get_metadata_keys().unwrap(), vec![b"schema".to_vec()]);
    assert!(shard.get_metadata(b"missing").unwrap().is_empty());
    ctx.pool.checkin(&shard);
}
