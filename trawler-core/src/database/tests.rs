use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::config::DataPlaneConfig;
use crate::endpoint::{Endpoint, Endpoints};
use crate::engine::DataPlane;
use crate::pool::Timeout;
use crate::serialise::sortable_serialise;
use crate::storage::Data;

fn engine() -> Arc<DataPlane> {
    DataPlane::new(DataPlaneConfig::default())
}

fn open_database(ctx: &Arc<DataPlane>, dir: &TempDir, n_shards: usize) -> Database {
    let endpoints = Endpoints::new(
        (0..n_shards)
            .map(|i| Endpoint::local(dir.path().join(format!("db.{i}"))))
            .collect(),
    );
    ctx.database(
        &endpoints,
        OpenFlags::WRITABLE | OpenFlags::CREATE_OR_OPEN,
        Timeout::After(Duration::from_secs(2)),
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

fn release(ctx: &Arc<DataPlane>, database: Database) {
    ctx.release(database);
}

#[test]
fn global_id_arithmetic_round_trips() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 3);

    for _ in 0..12 {
        let did = database
            .add_document(doc_with_obj(b"Qx", serde_json::json!({})), false, true)
            .unwrap();
        let (shard_num, shard_did) = database.route_did(did);
        assert_eq!(database.global_did(shard_num, shard_did), did);
        assert!(database.get_document(did).is_ok());
    }
    release(&ctx, database);
}

#[test]
fn sentinel_term_insert_computes_global_id() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 3);

    let mut term = b"QN".to_vec();
    term.extend_from_slice(&sortable_serialise(0.0));
    let did = database
        .replace_document_term(
            &term,
            doc_with_obj(b"ignored", serde_json::json!({"_id": 0})),
            false,
            true,
            false,
        )
        .unwrap();
    assert!(did >= 1);

    // The freshly assigned id routes back to the same document.
    let stored = database.get_document(did).unwrap();
    let data = Data::from_serialised(stored.get_data()).unwrap();
    assert_eq!(data.get_obj().unwrap()["_id"], serde_json::json!(did));

    // Updating through the computed id term goes to the same shard.
    let mut id_term = b"QN".to_vec();
    id_term.extend_from_slice(&sortable_serialise(did as f64));
    let updated = database
        .replace_document_term(
            &id_term,
            doc_with_obj(b"ignored", serde_json::json!({"_id": did, "v": 2})),
            false,
            true,
            false,
        )
        .unwrap();
    assert_eq!(updated, did);
    release(&ctx, database);
}

#[test]
fn term_routing_is_stable() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 3);

    let did = database
        .replace_document_term(
            b"Quser/alice",
            doc_with_obj(b"Quser/alice", serde_json::json!({"name": "alice"})),
            false,
            true,
            false,
        )
        .unwrap();

    let updated = database
        .replace_document_term(
            b"Quser/alice",
            doc_with_obj(b"Quser/alice", serde_json::json!({"name": "alice", "v": 2})),
            false,
            true,
            false,
        )
        .unwrap();
    assert_eq!(updated, did);

    assert_eq!(database.find_document(b"Quser/alice").unwrap(), did);

    database
        .delete_document_term(b"Quser/alice", false, true, None)
        .unwrap();
    assert!(matches!(
        database.find_document(b"Quser/alice"),
        Err(Error::NotFound(_))
    ));
    release(&ctx, database);
}

#[test]
fn metadata_broadcast_and_first_non_empty() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 3);

    database.set_metadata(b"schema", b"{}", false, true).unwrap();
    assert_eq!(database.get_metadata(b"schema").unwrap(), b"{}".to_vec());
    assert!(database.get_metadata(b"missing").unwrap().is_empty());
    assert_eq!(database.get_metadata_keys().unwrap(), vec![b"schema".to_vec()]);

    // Every shard received the broadcast.
    for shard in database.shards() {
        assert_eq!(shard.get_metadata(b"schema").unwrap(), b"{}".to_vec());
    }
    release(&ctx, database);
}

#[test]
fn spelling_broadcast() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 2);

    database.add_spelling(b"trawler", 2, false, true).unwrap();
    assert_eq!(database.remove_spelling(b"trawler", 1, false, true).unwrap(), 1);
    release(&ctx, database);
}

#[test]
fn search_merges_shards() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 3);

    let mut expected = Vec::new();
    for n in 0..9 {
        let mut doc = doc_with_obj(
            format!("Qdoc/{n}").as_bytes(),
            serde_json::json!({"n": n}),
        );
        doc.add_term(b"color:blue".to_vec());
        let did = database.add_document(doc, false, true).unwrap();
        expected.push(did);
    }
    database.commit(true, true).unwrap();

    let query = Query::term(b"color:blue".to_vec());
    let matches = database.search(&query, None, 0, usize::MAX).unwrap();
    let mut found: Vec<u64> = matches.iter().map(|m| m.docid).collect();
    found.sort_unstable();
    expected.sort_unstable();
    assert_eq!(found, expected);

    // Pagination slices the merged set.
    let page = database.search(&query, None, 3, 4).unwrap();
    assert_eq!(page.len(), 4);
    release(&ctx, database);
}

#[test]
fn dump_documents_resolves_objects() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 2);

    for n in 0..4 {
        database
            .add_document(
                doc_with_obj(format!("Qd{n}").as_bytes(), serde_json::json!({"n": n})),
                false,
                true,
            )
            .unwrap();
    }
    let docs = database.dump_documents().unwrap();
    assert_eq!(docs.len(), 4);
    for doc in docs {
        assert!(doc.get("n").is_some());
        assert!(doc.get("_id").is_some());
    }
    release(&ctx, database);
}

#[test]
fn commit_tolerates_missing_shard_but_not_all() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let database = open_database(&ctx, &dir, 2);

    database
        .add_document(doc_with_obj(b"Qa", serde_json::json!({})), false, true)
        .unwrap();
    assert!(database.commit(true, true).unwrap());
    release(&ctx, database);
}
