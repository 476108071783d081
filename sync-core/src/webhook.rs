//! Webhook Processor (C9, §4.7): persists inbound deliveries and applies
//! them to destination collections with bounded worker-process parallelism.
//!
//! Ingress (an HTTP receiver outside this crate) hands off
//! `{jobId, eventId, headers, rawPayload}`; [`ingest_webhook_event`] is the
//! library-side entry point that turns that into a pending [`WebhookEvent`].
//! Headers are persisted on the event itself (signature verification needs
//! them again at processing time, which may be a separate process/tick from
//! ingest).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::connector::{Connector, UnknownConnectorType, WebhookOperation, WebhookVerifyError, WebhookVerifyRequest};
use crate::executor::live_collection_name;
use crate::gateway::{ConfigStoreGateway, GatewayError};
use crate::id::Id;
use crate::model::{DestinationRecord, ExecutionError, WebhookEvent, WebhookEventStatus};
use crate::store::{DocumentStore, StoreError};

/// Default bound on concurrently-processed webhook deliveries per worker
/// process (§4.7).
pub const DEFAULT_MAX_CONCURRENCY: usize = 25;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    UnknownConnector(#[from] UnknownConnectorType),
    #[error("connector `{0}` does not support webhooks")]
    NotSupported(String),
    #[error(transparent)]
    Verify(#[from] WebhookVerifyError),
    #[error(transparent)]
    Extract(#[from] crate::connector::FetchError),
}

impl crate::error::Classify for WebhookError {
    fn classify(&self) -> crate::error::ErrorClass {
        crate::error::ErrorClass::Fatal
    }
}

/// What applying one event actually did (§4.7 step 5): an unmapped event
/// type is not a failure, it's a deliberate no-op that must not be retried.
enum ApplyOutcome {
    Applied,
    SkippedUnmappedEventType,
}

/// Records a newly-received delivery as `pending` and returns its id. The
/// HTTP receiver calls this synchronously and replies to the sender; actual
/// processing happens later on the bounded consumer loop (§4.7).
pub async fn ingest_webhook_event(
    gateway: &ConfigStoreGateway,
    job_id: Id,
    event_id: String,
    event_type: String,
    headers: HashMap<String, String>,
    raw_payload: Value,
) -> Result<Id, WebhookError> {
    let event = WebhookEvent {
        id: Id::new(),
        job_id,
        event_id,
        event_type,
        received_at: Utc::now(),
        attempts: 0,
        status: WebhookEventStatus::Pending,
        headers,
        raw_payload,
        error: None,
        processed_at: None,
        processing_duration_ms: None,
    };
    gateway.insert_webhook_event(&event).await?;
    Ok(event.id)
}

/// Processes one event end to end (§4.7 steps 1-11).
pub async fn process_webhook_event(gateway: &ConfigStoreGateway, event_id: Id) -> Result<(), WebhookError> {
    let started = Utc::now();
    let mut event = gateway.get_webhook_event(event_id).await?;
    event.status = WebhookEventStatus::Processing;
    event.attempts += 1;
    gateway.save_webhook_event(&event).await?;

    let outcome = apply_webhook_event(gateway, &event).await;

    event.processed_at = Some(Utc::now());
    event.processing_duration_ms = Some((event.processed_at.unwrap() - started).num_milliseconds());
    match &outcome {
        Ok(ApplyOutcome::Applied) => {
            event.status = WebhookEventStatus::Completed;
            event.error = None;
        }
        Ok(ApplyOutcome::SkippedUnmappedEventType) => {
            log::info!(
                "webhook event {} has no mapping for event type `{}`; marking completed without applying",
                event.id,
                event.event_type
            );
            event.status = WebhookEventStatus::Completed;
            event.error = None;
        }
        Err(e) => {
            event.status = WebhookEventStatus::Failed;
            event.error = Some(ExecutionError {
                message: e.to_string(),
                stack: None,
                code: None,
            });
        }
    }
    gateway.save_webhook_event(&event).await?;
    outcome.map(|_| ())
}

async fn apply_webhook_event(gateway: &ConfigStoreGateway, event: &WebhookEvent) -> Result<ApplyOutcome, WebhookError> {
    let job = gateway.get_job(event.job_id).await?;
    let connector_config = gateway.get_connector(job.connector_id).await?;
    let destination = gateway.get_destination(job.destination_id).await?;
    let connector = crate::connector::registry().get_connector(&connector_config)?;

    if !connector.supports_webhooks() {
        return Err(WebhookError::NotSupported(connector_config.name.clone()));
    }

    let payload_bytes = serde_json::to_vec(&event.raw_payload).unwrap_or_default();
    let secret = connector_config
        .config
        .get("webhookSecret")
        .and_then(Value::as_str)
        .unwrap_or_default();
    connector.verify_webhook(WebhookVerifyRequest {
        payload: &payload_bytes,
        headers: &event.headers,
        secret,
    })?;

    let Some(mapping) = connector.get_webhook_event_mapping(&event.event_type) else {
        return Ok(ApplyOutcome::SkippedUnmappedEventType);
    };
    let extracted = connector.extract_webhook_data(&event.raw_payload)?;

    let live = live_collection_name(&connector_config.name, &mapping.entity);
    let staging = crate::executor::staging_collection_name(&live);

    let store = DocumentStore::new(destination_client(&destination).await?);
    // Never implicitly created here: a concurrently in-flight full sync owns
    // staging table lifecycle (executor.rs), this only mirrors into it.
    let staging_exists = store.table_exists(&staging).await?;

    match mapping.operation {
        WebhookOperation::Upsert => {
            let record = DestinationRecord::wrap(
                crate::model::RawRecord {
                    natural_id: extracted.natural_id.clone(),
                    payload: extracted.data.clone(),
                },
                connector_config.id,
                &connector_config.name,
                Utc::now(),
                Some(event.id),
            );
            store.upsert_batch(&live, std::slice::from_ref(&record)).await?;
            if staging_exists {
                store.upsert_batch(&staging, std::slice::from_ref(&record)).await?;
            }
        }
        WebhookOperation::Delete => {
            store.delete_by_id(&live, &extracted.natural_id, connector_config.id).await?;
            if staging_exists {
                store.delete_by_id(&staging, &extracted.natural_id, connector_config.id).await?;
            }
        }
    }

    Ok(ApplyOutcome::Applied)
}

/// Webhook writes target the tenant's own destination directly rather than
/// through the shared pool, so a slow webhook never starves a scheduled
/// sync of a pool slot.
async fn destination_client(destination: &crate::model::Destination) -> Result<Arc<tokio_postgres::Client>, WebhookError> {
    let (client, connection) = tokio_postgres::connect(&destination.connection.connection_string, tokio_postgres::NoTls)
        .await
        .map_err(StoreError::from)?;
    let destination_id = destination.id;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("webhook destination connection for `{destination_id}` closed: {e}");
        }
    });
    Ok(Arc::new(client))
}

/// Bounded consumer loop (§4.7): pulls queued event ids and processes up to
/// `max_concurrency` of them at once.
pub async fn run_consumer_loop(gateway: Arc<ConfigStoreGateway>, mut rx: tokio::sync::mpsc::Receiver<Id>, max_concurrency: usize) {
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    while let Some(event_id) = rx.recv().await {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
        let gateway = gateway.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = process_webhook_event(&gateway, event_id).await {
                log::warn!("webhook event {event_id} failed: {e}");
            }
        });
    }
}

/// Intake sweep: the HTTP receiver that calls [`ingest_webhook_event`] may
/// run in a different process than the consumer loop, so pending events are
/// picked up by polling rather than an in-process channel send alone.
pub fn spawn_pending_poll(gateway: Arc<ConfigStoreGateway>, tx: tokio::sync::mpsc::Sender<Id>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match gateway.list_pending_webhook_events(100).await {
                Ok(events) => {
                    for event in events {
                        if tx.send(event.id).await.is_err() {
                            log::warn!("webhook intake channel closed, stopping poll for this tick");
                            break;
                        }
                    }
                }
                Err(e) => log::error!("webhook pending-event poll failed: {e}"),
            }
        }
    })
}

/// Retry sweep (§4.7): every 30 minutes, resets failed events with fewer
/// than 5 attempts back to pending so the consumer loop picks them up again.
pub fn spawn_retry_sweep(gateway: Arc<ConfigStoreGateway>, tx: tokio::sync::mpsc::Sender<Id>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30 * 60));
        loop {
            ticker.tick().await;
            match gateway.list_failed_webhook_events_for_retry(100).await {
                Ok(events) => {
                    for mut event in events {
                        event.status = WebhookEventStatus::Pending;
                        if let Err(e) = gateway.save_webhook_event(&event).await {
                            log::error!("failed to requeue webhook event {}: {e}", event.id);
                            continue;
                        }
                        if tx.send(event.id).await.is_err() {
                            log::warn!("webhook retry channel closed, stopping requeue for this tick");
                            break;
                        }
                    }
                }
                Err(e) => log::error!("webhook retry sweep failed: {e}"),
            }
        }
    })
}

/// Daily cleanup (§4.7): deletes `completed` events older than 30 days.
pub fn spawn_cleanup(gateway: Arc<ConfigStoreGateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            ticker.tick().await;
            match gateway.delete_old_completed_webhook_events(Duration::from_secs(30 * 24 * 60 * 60)).await {
                Ok(n) if n > 0 => log::info!("deleted {n} stale webhook event(s)"),
                Ok(_) => {}
                Err(e) => log::error!("webhook event cleanup failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_concurrency_matches_design_default() {
        assert_eq!(DEFAULT_MAX_CONCURRENCY, 25);
    }
}
