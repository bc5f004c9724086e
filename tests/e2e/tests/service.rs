//! Protocol behavior through the service layer.

use std::sync::Arc;

use engram_e2e_tests::fresh_store;

use engram_core::ConsolidationEngine;
use engram_service::{MemoryService, Request, Response};
use serde_json::{json, Value};

fn service() -> (MemoryService, tempfile::TempDir) {
    let (store, dir) = fresh_store();
    let engine = Arc::new(ConsolidationEngine::new(store.clone(), None));
    (MemoryService::new(store, engine), dir)
}

async fn call(service: &MemoryService, id: i64, op: &str, params: Value) -> Response {
    service
        .handle(Request {
            id: Some(Value::from(id)),
            op: op.to_string(),
            params: Some(params),
        })
        .await
        .expect("request with id always gets a response")
}

#[tokio::test]
async fn full_store_query_delete_cycle() {
    let (service, _dir) = service();

    let stored = call(
        &service,
        1,
        "store",
        json!({"content": "retrospective notes for the march launch", "tags": ["retro"]}),
    )
    .await;
    assert!(stored.error.is_none());
    let hash = stored.result.unwrap()["contentHash"].as_str().unwrap().to_string();

    let fetched = call(&service, 2, "get_by_hash", json!({"hash": hash})).await;
    assert_eq!(
        fetched.result.unwrap()["content"],
        "retrospective notes for the march launch"
    );

    let by_tag = call(
        &service,
        3,
        "search_by_tag",
        json!({"tags": ["retro"], "mode": "any"}),
    )
    .await;
    assert_eq!(by_tag.result.unwrap().as_array().unwrap().len(), 1);

    let exact = call(
        &service,
        4,
        "exact_match",
        json!({"text": "retrospective notes for the march launch"}),
    )
    .await;
    assert_eq!(exact.result.unwrap()["contentHash"].as_str().unwrap(), hash);

    let deleted = call(&service, 5, "delete", json!({"hash": hash})).await;
    assert_eq!(deleted.result.unwrap()["deleted"], true);

    let gone = call(&service, 6, "get_by_hash", json!({"hash": hash})).await;
    assert_eq!(gone.error.unwrap().kind, "not_found");
}

#[tokio::test]
async fn duplicate_store_reports_duplicate_flag() {
    let (service, _dir) = service();

    let first = call(&service, 1, "store", json!({"content": "dedup target"})).await;
    assert_eq!(first.result.unwrap()["duplicate"], false);

    let second = call(&service, 2, "store", json!({"content": "dedup target"})).await;
    assert_eq!(second.result.unwrap()["duplicate"], true);
}

#[tokio::test]
async fn stats_and_health_have_wire_shapes() {
    let (service, _dir) = service();
    call(&service, 1, "store", json!({"content": "counted"})).await;

    let stats = call(&service, 2, "stats", json!({})).await;
    let stats = stats.result.unwrap();
    assert_eq!(stats["liveMemories"], 1);
    assert_eq!(stats["healthy"], true);

    let health = call(&service, 3, "health_check", json!({"repair": true})).await;
    let health = health.result.unwrap();
    assert_eq!(health["ok"], true);
    assert!(health["issues"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn update_merges_tags_and_metadata() {
    let (service, _dir) = service();
    let stored = call(&service, 1, "store", json!({"content": "updatable"})).await;
    let hash = stored.result.unwrap()["contentHash"].as_str().unwrap().to_string();

    let updated = call(
        &service,
        2,
        "update",
        json!({
            "hash": hash,
            "delta": {
                "addTags": ["fresh"],
                "setMetadata": {"retention_class": "reference"}
            }
        }),
    )
    .await;
    let memory = updated.result.unwrap();
    assert_eq!(memory["tags"], json!(["fresh"]));
    assert_eq!(memory["metadata"]["retention_class"], "reference");
}

#[tokio::test]
async fn debug_retrieve_shape() {
    let (service, _dir) = service();
    call(&service, 1, "store", json!({"content": "debuggable entry"})).await;

    let debug = call(
        &service,
        2,
        "debug_retrieve",
        json!({"queryText": "debuggable entry", "k": 5}),
    )
    .await;
    let debug = debug.result.unwrap();
    assert_eq!(debug["queryEmbeddingHead"].as_array().unwrap().len(), 8);
    assert_eq!(debug["hits"].as_array().unwrap().len(), 1);
    assert!(debug["hits"][0]["cosine"].as_f64().unwrap() > 0.99);
}
