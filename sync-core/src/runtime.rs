//! Job Runtime (C8, §4.6): consumes `ExecuteEvent`s, enforces the per-job
//! singleton guard, and drives one job's entities through the chunked
//! runner from inside an Execution record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use rand::Rng;

use crate::chunked::{self, ChunkedError};
use crate::connector::{Connector, UnknownConnectorType};
use crate::error::Classify;
use crate::executor::SyncContext;
use crate::gateway::{ConfigStoreGateway, GatewayError};
use crate::id::Id;
use crate::model::{ExecutionError, ExecutionStats, ExecutionStatus, ExecutionSystem, JobExecution};
use crate::pool::{ConnectInfo, ConnectionPool, PoolContext, PoolError, PoolKey};
use crate::scheduler::ExecuteEvent;

const JOB_LOCK_TTL: Duration = Duration::from_secs(15 * 60);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const STARTUP_JITTER_MAX_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    UnknownConnector(#[from] UnknownConnectorType),
    #[error(transparent)]
    Chunked(#[from] ChunkedError),
}

pub struct JobRuntime {
    gateway: Arc<ConfigStoreGateway>,
    pool: Arc<ConnectionPool>,
    running: DashSet<Id>,
    worker_id: String,
    host: String,
}

impl JobRuntime {
    pub fn new(gateway: Arc<ConfigStoreGateway>, pool: Arc<ConnectionPool>, worker_id: String, host: String) -> Self {
        JobRuntime {
            gateway,
            pool,
            running: DashSet::new(),
            worker_id,
            host,
        }
    }

    /// Handles one `sync/job.execute` delivery (§4.6). At-least-once
    /// delivery is expected; redeliveries while a job is already running
    /// are silently discarded by the singleton guard.
    pub async fn handle_execute_event(&self, event: ExecuteEvent) -> Result<(), RuntimeError> {
        if !self.running.insert(event.job_id) {
            log::info!("job {} already running on this worker, discarding duplicate", event.job_id);
            return Ok(());
        }
        let _fast_path_guard = scopeguard(&self.running, event.job_id);

        if !self.gateway.try_acquire_job_lock(event.job_id, &self.worker_id, JOB_LOCK_TTL).await? {
            log::info!("job {} locked by another worker, skipping", event.job_id);
            return Ok(());
        }

        let jitter_secs = rand::thread_rng().r#gen::<u64>() % (STARTUP_JITTER_MAX_SECS + 1);
        tokio::time::sleep(Duration::from_secs(jitter_secs)).await;

        let result = self.run_job(event.job_id).await;
        self.gateway.release_job_lock(event.job_id, &self.worker_id).await?;
        result
    }

    async fn run_job(&self, job_id: Id) -> Result<(), RuntimeError> {
        let mut job = self.gateway.get_job(job_id).await?;
        if !job.enabled {
            log::info!("job {job_id} is disabled, skipping");
            return Ok(());
        }

        let system = ExecutionSystem {
            worker_id: self.worker_id.clone(),
            host: self.host.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let mut execution = JobExecution::new(&job, system);
        self.gateway.insert_execution(&execution).await?;

        job.last_run_at = Some(Utc::now());
        job.run_count += 1;
        self.gateway.save_job(&job).await?;

        let outcome = self.execute_job_entities(&job, &mut execution).await;

        execution.completed_at = Some(Utc::now());
        execution.duration_ms = Some((execution.completed_at.unwrap() - execution.started_at).num_milliseconds());

        match &outcome {
            Ok(stats) => {
                execution.status = ExecutionStatus::Completed;
                execution.success = true;
                execution.stats = Some(stats.clone());
                job.last_success_at = Some(Utc::now());
                job.last_error = None;
            }
            Err(e) => {
                execution.status = ExecutionStatus::Failed;
                execution.success = false;
                execution.error = Some(ExecutionError {
                    message: e.to_string(),
                    stack: None,
                    code: None,
                });
                job.last_error = Some(e.to_string());
            }
        }

        self.gateway.finish_execution_if_running(&execution).await?;
        self.gateway.save_job(&job).await?;

        outcome.map(|_| ())
    }

    async fn execute_job_entities(
        &self,
        job: &crate::model::SyncJob,
        execution: &mut JobExecution,
    ) -> Result<ExecutionStats, RuntimeError> {
        let connector_config = self.gateway.get_connector(job.connector_id).await?;
        let destination = self.gateway.get_destination(job.destination_id).await?;
        let connector = crate::connector::registry().get_connector(&connector_config)?;

        let handle = self
            .pool
            .get(PoolKey::new(PoolContext::Destination, destination.id.to_string()), || async {
                Ok(ConnectInfo {
                    connection_string: destination.connection.connection_string.clone(),
                    database: destination.connection.database.clone(),
                })
            })
            .await?;

        let entities = if job.entity_filter.is_empty() {
            connector.get_available_entities()
        } else {
            job.entity_filter.clone()
        };

        let ctx = SyncContext {
            connector: connector.as_ref(),
            connector_id: connector_config.id,
            connector_name: connector_config.name.clone(),
            destination_client: handle.client.clone(),
            sync_mode: job.sync_mode,
            batch_size: connector_config.settings.batch_size,
            rate_limit_delay: Duration::from_millis(connector_config.settings.rate_limit_delay_ms),
            max_retries: connector_config.settings.max_retries,
        };

        let mut stats = ExecutionStats::default();
        for entity in &entities {
            chunked::run_entity_to_completion(&ctx, entity).await?;
            self.gateway.touch_execution_heartbeat(execution.id).await.ok();
            stats.entities.insert(entity.clone(), stats.entities.get(entity).copied().unwrap_or(0) + 1);
        }
        Ok(stats)
    }
}

/// Removes the fast-path singleton-guard entry on drop regardless of how
/// `handle_execute_event` returns, the way a `finally` block would.
struct FastPathGuard<'a> {
    running: &'a DashSet<Id>,
    job_id: Id,
}

impl Drop for FastPathGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

fn scopeguard(running: &DashSet<Id>, job_id: Id) -> FastPathGuard<'_> {
    FastPathGuard { running, job_id }
}

/// Cleanup task (§4.6.1): every 15 minutes, abandon stale Executions and
/// purge expired job locks.
pub fn spawn_cleanup(gateway: Arc<ConfigStoreGateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15 * 60));
        loop {
            ticker.tick().await;
            match gateway.abandon_stale_executions(HEARTBEAT_TIMEOUT).await {
                Ok(n) if n > 0 => log::warn!("marked {n} execution(s) abandoned"),
                Ok(_) => {}
                Err(e) => log::error!("abandon-stale-executions sweep failed: {e}"),
            }
            if let Err(e) = gateway.delete_expired_locks().await {
                log::error!("expired-lock cleanup failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused_classify_import_is_exercised_by_chunked_error() {
        let e: Result<(), ChunkedError> = Err(ChunkedError::ChunkCapExceeded("leads".into(), 1000));
        assert!(matches!(e.unwrap_err().classify(), crate::error::ErrorClass::Fatal));
    }
}
