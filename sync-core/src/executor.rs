//! Sync Executor (C5, §4.5): applies one chunk of one entity from a
//! connector to a destination, staging full syncs and upserting incremental
//! ones directly into the live collection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::connector::{Connector, FetchOptions, RecordBatch, ResumableFetchOptions};
use crate::id::Id;
use crate::model::{DestinationRecord, FetchState, SyncMode};
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] crate::connector::FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("write-path task panicked or was cancelled")]
    WriterTaskFailed,
}

impl crate::error::Classify for SyncError {
    fn classify(&self) -> crate::error::ErrorClass {
        match self {
            SyncError::Fetch(e) => e.classify(),
            SyncError::Store(e) => e.classify(),
            SyncError::WriterTaskFailed => crate::error::ErrorClass::Fatal,
        }
    }
}

pub struct SyncContext<'a> {
    pub connector: &'a dyn Connector,
    pub connector_id: Id,
    pub connector_name: String,
    pub destination_client: Arc<tokio_postgres::Client>,
    pub sync_mode: SyncMode,
    pub batch_size: u32,
    pub rate_limit_delay: Duration,
    pub max_retries: u32,
}

pub fn live_collection_name(connector_name: &str, entity: &str) -> String {
    format!("{connector_name}_{entity}")
}

pub fn staging_collection_name(live: &str) -> String {
    format!("{live}_staging")
}

/// Runs up to `max_iterations` fetch iterations of `entity` (§4.5 steps
/// 1-5). The caller (C6) decides whether to invoke this again for the next
/// chunk.
pub async fn run_entity_sync_chunk(
    ctx: &SyncContext<'_>,
    entity: &str,
    state: Option<FetchState>,
    max_iterations: u32,
) -> Result<FetchState, SyncError> {
    let live = live_collection_name(&ctx.connector_name, entity);
    let stage = staging_collection_name(&live);
    let store = DocumentStore::new(ctx.destination_client.clone());
    let is_first_chunk = state.is_none();

    let target = match ctx.sync_mode {
        SyncMode::Full => {
            if is_first_chunk {
                store.drop_if_exists(&stage).await?;
                store.ensure_collection(&stage).await?;
                store.ensure_indexes(&stage).await;
            }
            stage.clone()
        }
        SyncMode::Incremental => {
            store.ensure_collection(&live).await?;
            store.ensure_indexes(&live).await;
            live.clone()
        }
    };

    let since = match ctx.sync_mode {
        SyncMode::Full => None,
        SyncMode::Incremental => store.max_synced_at(&live, ctx.connector_id).await?,
    };

    let (tx, mut rx) = mpsc::channel::<RecordBatch>(4);
    let writer_store = store.clone();
    let writer_target = target.clone();
    let connector_id = ctx.connector_id;
    let connector_name = ctx.connector_name.clone();

    let writer = tokio::spawn(async move {
        let mut records_written = 0u64;
        while let Some(batch) = rx.recv().await {
            let synced_at = Utc::now();
            let wrapped: Vec<DestinationRecord> = batch
                .records
                .into_iter()
                .map(|raw| DestinationRecord::wrap(raw, connector_id, &connector_name, synced_at, None))
                .collect();
            records_written += wrapped.len() as u64;
            writer_store.upsert_batch(&writer_target, &wrapped).await?;
        }
        Ok::<u64, StoreError>(records_written)
    });

    let fetch_opts = FetchOptions {
        entity,
        batch_size: ctx.batch_size,
        sink: tx,
        progress: None,
        since,
        rate_limit_delay: ctx.rate_limit_delay,
        max_retries: ctx.max_retries,
    };

    let fetch_result = if ctx.connector.supports_resumable_fetching() {
        ctx.connector
            .fetch_entity_chunk(ResumableFetchOptions {
                base: fetch_opts,
                max_iterations,
                state,
            })
            .await
    } else {
        ctx.connector.fetch_entity(fetch_opts).await.map(|_| FetchState {
            has_more: false,
            ..FetchState::default()
        })
    };

    let records_written = writer.await.map_err(|_| SyncError::WriterTaskFailed)??;
    log::info!("entity {entity}: wrote {records_written} records into {target}");

    let next_state = fetch_result?;

    if !next_state.has_more && ctx.sync_mode == SyncMode::Full {
        store.swap_staging(&stage, &live).await?;
    }

    Ok(next_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_follow_connector_entity_convention() {
        let live = live_collection_name("close", "leads");
        assert_eq!(live, "close_leads");
        assert_eq!(staging_collection_name(&live), "close_leads_staging");
    }
}
