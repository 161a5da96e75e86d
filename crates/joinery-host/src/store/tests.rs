//! Tests for the in-memory stores.

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;

#[fixture]
fn store() -> MemoryStore {
    MemoryStore::new()
}

#[rstest]
#[tokio::test]
async fn put_then_get_returns_document(store: MemoryStore) {
    store
        .put(json!({"_id": "repository_list", "list": []}))
        .await
        .expect("put");
    let doc = store.get("repository_list").await.expect("get");
    assert_eq!(doc["list"], json!([]));
}

#[rstest]
#[tokio::test]
async fn missing_key_is_not_found(store: MemoryStore) {
    let err = store.get("absent").await.expect_err("absent key");
    assert!(err.is_not_found());
}

#[rstest]
#[tokio::test]
async fn put_requires_an_id(store: MemoryStore) {
    let err = store.put(json!({"list": []})).await.expect_err("no id");
    assert!(matches!(err, StoreError::MissingId));
}

#[rstest]
#[tokio::test]
async fn all_docs_is_ordered_by_key(store: MemoryStore) {
    store.put(json!({"_id": "b"})).await.expect("put b");
    store.put(json!({"_id": "a"})).await.expect("put a");
    let ids: Vec<_> = store
        .all_docs()
        .await
        .expect("all docs")
        .into_iter()
        .filter_map(|doc| doc["_id"].as_str().map(str::to_owned))
        .collect();
    assert_eq!(ids, ["a", "b"]);
}

#[rstest]
#[tokio::test]
async fn remove_deletes_document(store: MemoryStore) {
    store.put(json!({"_id": "a"})).await.expect("put");
    store.remove("a").await.expect("remove");
    assert!(store.is_empty());
    assert!(store.remove("a").await.expect_err("second remove").is_not_found());
}

#[test]
fn workspace_stores_reuse_the_same_store() {
    let stores = MemoryWorkspaceStores::new();
    let first = stores.store("default");
    let second = stores.store("default");
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn content_hash_is_stable_hex() {
    let hash = content_hash("<config>{}</config>");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, content_hash("<config>{}</config>"));
    assert_ne!(hash, content_hash("<config>{ }</config>"));
}
