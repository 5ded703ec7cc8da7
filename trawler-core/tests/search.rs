//! End-to-end indexing and query scenarios over a real shard directory.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use trawler_core::backend::Document;
use trawler_core::config::DataPlaneConfig;
use trawler_core::endpoint::Endpoint;
use trawler_core::engine::DataPlane;
use trawler_core::pool::Timeout;
use trawler_core::query::dsl::QueryDsl;
use trawler_core::query::sort::KeyMaker;
use trawler_core::schema::{index_field, FieldSpec, FieldType, Schema};
use trawler_core::shard::Shard;
use trawler_core::storage::Data;
use trawler_core::{OpenFlags, Result};

fn engine() -> Arc<DataPlane> {
    DataPlane::new(DataPlaneConfig::default())
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

fn numeric_schema() -> Arc<Schema> {
    let mut schema = Schema::new();
    schema.insert(FieldSpec::new("n", FieldType::Integer, 10).with_accuracy(vec![10, 100]));
    Arc::new(schema)
}

fn index_numbers(shard: &Arc<Shard>, schema: &Schema, count: i64) -> Result<()> {
    let spec = schema.field("n").unwrap();
    for n in 0..count {
        let mut doc = Document::new();
        let term = format!("Qn/{n}");
        doc.add_boolean_term(term.as_bytes().to_vec());
        index_field(&mut doc, spec, &serde_json::json!(n))?;
        let data = Data::from_obj(&serde_json::json!({ "n": n }))?;
        doc.set_data(data.serialise());
        shard.replace_document_term(term.as_bytes(), doc, false, true, false)?;
    }
    shard.commit(true, true)?;
    Ok(())
}

#[test]
fn numeric_range_returns_exact_set() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));
    let schema = numeric_schema();

    let shard = writable(&ctx, &endpoint);
    index_numbers(&shard, &schema, 1000).unwrap();

    let dsl = QueryDsl::new(Arc::clone(&schema));
    let query = dsl
        .get_query(&serde_json::json!({
            "n": {"_in": {"_range": {"_from": 237, "_to": 762}}}
        }))
        .unwrap();

    let matches = shard.search(&query, None, 0, usize::MAX).unwrap();
    assert_eq!(matches.len(), 526);

    // Range soundness at the edges.
    for (lo, hi, expected) in [(0, 0, 1), (998, 1500, 2), (500, 499, 0)] {
        let query = dsl
            .get_query(&serde_json::json!({
                "n": {"_in": {"_range": {"_from": lo, "_to": hi}}}
            }))
            .unwrap();
        let matches = shard.search(&query, None, 0, usize::MAX).unwrap();
        assert_eq!(matches.len(), expected, "range [{lo}, {hi}]");
    }
    ctx.pool.checkin(&shard);
}

#[test]
fn oversized_range_degrades_to_posting_source() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    // A single fine level: a wide range exceeds the term cap at every
    // available level and the posting source alone keeps it exact.
    let mut schema = Schema::new();
    schema.insert(FieldSpec::new("n", FieldType::Integer, 10).with_accuracy(vec![10]));
    let schema = Arc::new(schema);

    let shard = writable(&ctx, &endpoint);
    index_numbers(&shard, &schema, 1000).unwrap();

    let dsl = QueryDsl::new(Arc::clone(&schema));
    let query = dsl
        .get_query(&serde_json::json!({
            "n": {"_in": {"_range": {"_from": 3, "_to": 996}}}
        }))
        .unwrap();
    assert!(matches!(
        query,
        trawler_core::query::Query::ValueRange { .. }
    ));
    let matches = shard.search(&query, None, 0, usize::MAX).unwrap();
    assert_eq!(matches.len(), 994);
    ctx.pool.checkin(&shard);
}

#[test]
fn geo_intersection_ranks_by_distance() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let mut schema = Schema::new();
    schema.insert(FieldSpec::new("place", FieldType::Geo, 10).with_accuracy(vec![5, 10, 15]));
    let schema = Arc::new(schema);
    let spec = schema.field("place").unwrap();

    let shard = writable(&ctx, &endpoint);
    let points = [(0.5, 0.5, "center"), (2.0, 2.0, "outside"), (0.9, 0.9, "corner")];
    let mut dids = std::collections::HashMap::new();
    for (lat, lon, name) in points {
        let mut doc = Document::new();
        let term = format!("Qp/{name}");
        doc.add_boolean_term(term.as_bytes().to_vec());
        index_field(
            &mut doc,
            spec,
            &serde_json::json!({"_point": {"_latitude": lat, "_longitude": lon}}),
        )
        .unwrap();
        let did = shard
            .replace_document_term(term.as_bytes(), doc, false, true, false)
            .unwrap();
        dids.insert(name, did);
    }
    shard.commit(true, true).unwrap();

    let dsl = QueryDsl::new(Arc::clone(&schema));
    let query = dsl
        .get_query(&serde_json::json!({
            "place": {"_in": {"_geo_intersection": {"_polygon": {
                "_latitude": [0.0, 0.0, 1.0, 1.0],
                "_longitude": [0.0, 1.0, 1.0, 0.0],
            }}}}
        }))
        .unwrap();

    let matches = shard.search(&query, None, 0, usize::MAX).unwrap();
    let found: Vec<u32> = matches.iter().map(|m| m.docid).collect();
    assert_eq!(
        found,
        vec![dids["center"], dids["corner"]],
        "expected the two inside points ordered by centroid distance"
    );
    ctx.pool.checkin(&shard);
}

#[test]
fn sort_orders_by_slot_value() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));
    let schema = numeric_schema();

    let shard = writable(&ctx, &endpoint);
    index_numbers(&shard, &schema, 10).unwrap();

    let dsl = QueryDsl::new(Arc::clone(&schema));
    let query = dsl
        .get_query(&serde_json::json!({
            "n": {"_in": {"_range": {"_from": 0, "_to": 9}}}
        }))
        .unwrap();
    let sorter: KeyMaker = dsl.get_sorter(&serde_json::json!(["-n"])).unwrap();

    let matches = shard.search(&query, Some(&sorter), 0, 3).unwrap();
    let values: Vec<i64> = matches
        .iter()
        .map(|m| {
            let doc = shard.get_document(m.docid).unwrap();
            let data = Data::from_serialised(doc.get_data()).unwrap();
            data.get_obj().unwrap()["n"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(values, vec![9, 8, 7]);
    ctx.pool.checkin(&shard);
}

#[test]
fn raw_expression_end_to_end() {
    let dir = TempDir::new().unwrap();
    let ctx = engine();
    let endpoint = Endpoint::local(dir.path().join("db"));

    let mut schema = Schema::new();
    schema.insert(FieldSpec::new("title", FieldType::Text, 10));
    schema.insert(FieldSpec::new("tag", FieldType::Keyword, 11));
    let schema = Arc::new(schema);

    let shard = writable(&ctx, &endpoint);
    let docs = [
        ("Qd/1", "the quick brown fox", "animal"),
        ("Qd/2", "the lazy dog", "animal"),
        ("Qd/3", "quick sort algorithms", "code"),
    ];
    for (term, title, tag) in docs {
        let mut doc = Document::new();
        doc.add_boolean_term(term.as_bytes().to_vec());
        index_field(&mut doc, schema.field("title").unwrap(), &serde_json::json!(title)).unwrap();
        index_field(&mut doc, schema.field("tag").unwrap(), &serde_json::json!(tag)).unwrap();
        shard
            .replace_document_term(term.as_bytes(), doc, false, true, false)
            .unwrap();
    }
    shard.commit(true, true).unwrap();

    let dsl = QueryDsl::new(Arc::clone(&schema));
    let query = dsl
        .get_query(&serde_json::json!("tag:animal AND title:(quick OR lazy)"))
        .unwrap();
    let matches = shard.search(&query, None, 0, usize::MAX).unwrap();
    assert_eq!(matches.len(), 2);

    let query = dsl.get_query(&serde_json::json!({"title": "qui*"})).unwrap();
    let matches = shard.search(&query, None, 0, usize::MAX).unwrap();
    assert_eq!(matches.len(), 2);
    ctx.pool.checkin(&shard);
}
