//! Exercises the chunked full-sync pipeline (executor.rs) end to end against
//! a real Postgres and a fake paginated connector, covering the literal
//! boundary scenario of five 100-record upstream pages walked two at a time.

#![cfg(feature = "sync-core-tests")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use sync_core::connector::{
    Connector, ConnectorMetadata, FetchError, FetchOptions, ResumableFetchOptions, TestConnectionResult, ValidationResult,
};
use sync_core::executor::{live_collection_name, run_entity_sync_chunk, SyncContext};
use sync_core::id::Id;
use sync_core::model::{FetchState, RawRecord, SyncMode};
use sync_core::store::DocumentStore;

const PAGE_SIZE: u64 = 100;

struct FakePaginatedConnector {
    total_records: u64,
}

#[async_trait]
impl Connector for FakePaginatedConnector {
    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            name: "fake",
            version: "0.0.0",
            description: "test double",
            supported_entities: vec!["items"],
        }
    }

    fn validate_config(&self) -> ValidationResult {
        ValidationResult { valid: true, errors: vec![] }
    }

    async fn test_connection(&self) -> TestConnectionResult {
        TestConnectionResult {
            success: true,
            message: "ok".to_string(),
            details: None,
        }
    }

    fn get_available_entities(&self) -> Vec<String> {
        vec!["items".to_string()]
    }

    async fn fetch_entity(&self, _opts: FetchOptions<'_>) -> Result<(), FetchError> {
        unimplemented!("this fake only exercises the resumable path")
    }

    fn supports_resumable_fetching(&self) -> bool {
        true
    }

    async fn fetch_entity_chunk(&self, opts: ResumableFetchOptions<'_>) -> Result<FetchState, FetchError> {
        let mut offset = opts.state.as_ref().and_then(|s| s.offset).unwrap_or(0);
        let mut total_processed = opts.state.as_ref().map(|s| s.total_processed).unwrap_or(0);
        let mut iterations = 0u32;

        while iterations < opts.max_iterations && offset < self.total_records {
            let page_len = PAGE_SIZE.min(self.total_records - offset);
            let records = (0..page_len)
                .map(|i| RawRecord {
                    natural_id: (offset + i).to_string(),
                    payload: json!({ "n": offset + i }),
                })
                .collect();
            opts.base
                .sink
                .send(sync_core::connector::RecordBatch {
                    entity: opts.base.entity.to_string(),
                    records,
                })
                .await
                .map_err(|_| FetchError::Upstream("writer channel closed".into()))?;
            offset += page_len;
            total_processed += page_len;
            iterations += 1;
        }

        Ok(FetchState {
            offset: Some(offset),
            page: None,
            cursor: None,
            total_processed,
            has_more: offset < self.total_records,
            iterations_in_chunk: iterations,
            metadata: Value::Null,
        })
    }
}

async fn connect() -> Arc<tokio_postgres::Client> {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must point at a scratch database");
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Arc::new(client)
}

#[tokio::test]
async fn chunked_full_sync_matches_the_five_page_boundary_scenario() {
    let client = connect().await;
    let connector = FakePaginatedConnector { total_records: 500 };
    let connector_id = Id::new();
    let live = live_collection_name("fake", "items");
    let store = DocumentStore::new(client.clone());
    store.drop_if_exists(&live).await.unwrap();

    let ctx = SyncContext {
        connector: &connector,
        connector_id,
        connector_name: "fake".to_string(),
        destination_client: client.clone(),
        sync_mode: SyncMode::Full,
        batch_size: 100,
        rate_limit_delay: Duration::from_millis(0),
        max_retries: 0,
    };

    let chunk1 = run_entity_sync_chunk(&ctx, "items", None, 2).await.unwrap();
    assert!(chunk1.has_more);
    assert_eq!(chunk1.offset, Some(200));
    assert_eq!(chunk1.total_processed, 200);

    let chunk2 = run_entity_sync_chunk(&ctx, "items", Some(chunk1), 2).await.unwrap();
    assert!(chunk2.has_more);
    assert_eq!(chunk2.offset, Some(400));
    assert_eq!(chunk2.total_processed, 400);

    let chunk3 = run_entity_sync_chunk(&ctx, "items", Some(chunk2), 2).await.unwrap();
    assert!(!chunk3.has_more);
    assert_eq!(chunk3.total_processed, 500);

    let count: i64 = store
        .client_for_test()
        .query_one(&format!("SELECT count(*) FROM {live}"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 500, "promoted live collection should hold all 500 records");

    store.drop_if_exists(&live).await.unwrap();
}

#[tokio::test]
async fn zero_record_full_sync_promotes_an_empty_live_collection() {
    let client = connect().await;
    let connector = FakePaginatedConnector { total_records: 0 };
    let live = live_collection_name("fake", "empty_items");
    let store = DocumentStore::new(client.clone());
    store.drop_if_exists(&live).await.unwrap();

    let ctx = SyncContext {
        connector: &connector,
        connector_id: Id::new(),
        connector_name: "fake".to_string(),
        destination_client: client.clone(),
        sync_mode: SyncMode::Full,
        batch_size: 100,
        rate_limit_delay: Duration::from_millis(0),
        max_retries: 0,
    };

    let result = run_entity_sync_chunk(&ctx, "empty_items", None, 10).await.unwrap();
    assert!(!result.has_more);
    assert_eq!(result.total_processed, 0);
    assert!(store.table_exists(&live).await.unwrap(), "staging must still promote to an empty live table");

    let count: i64 = store
        .client_for_test()
        .query_one(&format!("SELECT count(*) FROM {live}"), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 0);

    store.drop_if_exists(&live).await.unwrap();
}
