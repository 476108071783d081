//! Integration tests against a real Postgres, the way the teacher's own
//! suite only ever validates against a live captive server rather than a
//! mock. Gated behind `sync-core-tests` since they need `TEST_DATABASE_URL`
//! pointed at a scratch database.

#![cfg(feature = "sync-core-tests")]

use std::sync::Arc;

use chrono::Utc;
use sync_core::id::Id;
use sync_core::model::{DestinationRecord, RawRecord};
use sync_core::store::DocumentStore;

async fn connect() -> Arc<tokio_postgres::Client> {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must point at a scratch database");
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Arc::new(client)
}

fn record(natural_id: &str, data_source_id: Id, body: serde_json::Value) -> DestinationRecord {
    DestinationRecord::wrap(
        RawRecord {
            natural_id: natural_id.to_string(),
            payload: body,
        },
        data_source_id,
        "acme",
        Utc::now(),
        None,
    )
}

#[tokio::test]
async fn upsert_then_update_replaces_the_document() {
    let store = DocumentStore::new(connect().await);
    let table = "it_upsert_replaces";
    store.drop_if_exists(table).await.unwrap();
    store.ensure_collection(table).await.unwrap();

    let data_source_id = Id::new();
    store
        .upsert_batch(table, &[record("lead-1", data_source_id, serde_json::json!({"name": "Ada"}))])
        .await
        .unwrap();
    store
        .upsert_batch(table, &[record("lead-1", data_source_id, serde_json::json!({"name": "Ada Lovelace"}))])
        .await
        .unwrap();

    let count: i64 = store
        .client_for_test()
        .query_one(&format!("SELECT count(*) FROM {table} WHERE id = $1"), &[&"lead-1"])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 1, "conflict target (id, data_source_id) should update in place, not duplicate");

    store.drop_if_exists(table).await.unwrap();
}

#[tokio::test]
async fn delete_by_id_only_removes_the_matching_data_source() {
    let store = DocumentStore::new(connect().await);
    let table = "it_delete_scopes_by_source";
    store.drop_if_exists(table).await.unwrap();
    store.ensure_collection(table).await.unwrap();

    let source_a = Id::new();
    let source_b = Id::new();
    store
        .upsert_batch(
            table,
            &[
                record("shared-natural-id", source_a, serde_json::json!({"owner": "a"})),
                record("shared-natural-id", source_b, serde_json::json!({"owner": "b"})),
            ],
        )
        .await
        .unwrap();

    store.delete_by_id(table, "shared-natural-id", source_a).await.unwrap();

    let remaining: i64 = store
        .client_for_test()
        .query_one(&format!("SELECT count(*) FROM {table}"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(remaining, 1, "deleting one data source's row must not touch the other's");

    store.drop_if_exists(table).await.unwrap();
}

#[tokio::test]
async fn swap_staging_atomically_replaces_the_live_table() {
    let store = DocumentStore::new(connect().await);
    let live = "it_swap_live";
    let stage = "it_swap_stage";
    store.drop_if_exists(live).await.unwrap();
    store.drop_if_exists(stage).await.unwrap();

    store.ensure_collection(live).await.unwrap();
    store
        .upsert_batch(live, &[record("old", Id::new(), serde_json::json!({"gen": "old"}))])
        .await
        .unwrap();

    store.ensure_collection(stage).await.unwrap();
    store
        .upsert_batch(stage, &[record("new", Id::new(), serde_json::json!({"gen": "new"}))])
        .await
        .unwrap();

    store.swap_staging(stage, live).await.unwrap();

    assert!(!store.table_exists(stage).await.unwrap());
    let row = store
        .client_for_test()
        .query_one(&format!("SELECT id FROM {live}"), &[])
        .await
        .unwrap();
    let id: String = row.get(0);
    assert_eq!(id, "new", "swap_staging should leave only the staged generation live");

    store.drop_if_exists(live).await.unwrap();
}

#[tokio::test]
async fn max_synced_at_is_scoped_to_one_data_source() {
    let store = DocumentStore::new(connect().await);
    let table = "it_max_synced_at";
    store.drop_if_exists(table).await.unwrap();
    store.ensure_collection(table).await.unwrap();

    let source = Id::new();
    let other = Id::new();
    assert!(store.max_synced_at(table, source).await.unwrap().is_none());

    store
        .upsert_batch(table, &[record("a", source, serde_json::json!({})), record("b", other, serde_json::json!({}))])
        .await
        .unwrap();

    assert!(store.max_synced_at(table, source).await.unwrap().is_some());

    store.drop_if_exists(table).await.unwrap();
}
