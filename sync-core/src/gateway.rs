//! Config Store Gateway (C1, §4.1): read-only access to the control-plane
//! store, with secret decryption applied on the way out.
//!
//! Grounded in the teacher's own Postgres driver usage
//! (`postgres::validate_data`/`query_to_text` in the teacher repo): direct
//! `tokio_postgres` calls against `jsonb` columns, no ORM.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_postgres::Client;

use crate::config_schema::{decrypt_config, schema_for, SchemaWalkError};
use crate::crypto::SecretCipher;
use crate::id::Id;
use crate::model::{
    ConnectorConfig, Destination, DestinationConnection, JobExecution, SyncJob, WebhookEvent, Workspace,
};

type Connector = ConnectorConfig;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no config schema registered for connector type `{0}`")]
    ConfigInvalid(String),
    #[error("failed to decrypt connector config: {0}")]
    DecryptFailed(#[from] SchemaWalkError),
    #[error("malformed row: {0}")]
    MalformedRow(String),
    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),
}

pub struct ConfigStoreGateway {
    client: Arc<Client>,
    cipher: Arc<dyn SecretCipher>,
}

impl ConfigStoreGateway {
    pub fn new(client: Arc<Client>, cipher: Arc<dyn SecretCipher>) -> Self {
        ConfigStoreGateway { client, cipher }
    }

    pub async fn get_job(&self, id: Id) -> Result<SyncJob, GatewayError> {
        let row = self
            .client
            .query_opt(
                "SELECT document FROM syncjobs WHERE id = $1",
                &[&id.to_string()],
            )
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("syncjob {id}")))?;
        decode_row(&row)
    }

    pub async fn list_enabled_jobs(&self) -> Result<Vec<SyncJob>, GatewayError> {
        let rows = self
            .client
            .query(
                "SELECT document FROM syncjobs WHERE (document->>'enabled')::boolean = true",
                &[],
            )
            .await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn get_connector(&self, id: Id) -> Result<Connector, GatewayError> {
        let row = self
            .client
            .query_opt(
                "SELECT document FROM connectors WHERE id = $1",
                &[&id.to_string()],
            )
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("connector {id}")))?;
        let connector: Connector = decode_row(&row)?;
        self.decrypt_connector(connector)
    }

    pub async fn list_active_connectors(
        &self,
        workspace_id: Option<Id>,
    ) -> Result<Vec<Connector>, GatewayError> {
        let rows = match workspace_id {
            Some(ws) => {
                self.client
                    .query(
                        "SELECT document FROM connectors WHERE (document->>'isActive')::boolean = true AND document->>'workspaceId' = $1",
                        &[&ws.to_string()],
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        "SELECT document FROM connectors WHERE (document->>'isActive')::boolean = true",
                        &[],
                    )
                    .await?
            }
        };
        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<Connector>, GatewayError>>()?
            .into_iter()
            .map(|c| self.decrypt_connector(c))
            .collect()
    }

    pub async fn get_destination(&self, id: Id) -> Result<Destination, GatewayError> {
        let row = self
            .client
            .query_opt(
                "SELECT document FROM databases WHERE id = $1",
                &[&id.to_string()],
            )
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("destination {id}")))?;
        let dest: Destination = decode_row(&row)?;
        self.decrypt_destination(dest)
    }

    pub async fn list_destinations(&self, workspace_id: Id) -> Result<Vec<Destination>, GatewayError> {
        let rows = self
            .client
            .query(
                "SELECT document FROM databases WHERE document->>'workspaceId' = $1",
                &[&workspace_id.to_string()],
            )
            .await?;
        rows.iter()
            .map(decode_row)
            .collect::<Result<Vec<Destination>, GatewayError>>()?
            .into_iter()
            .map(|d| self.decrypt_destination(d))
            .collect()
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>, GatewayError> {
        let rows = self.client.query("SELECT document FROM workspaces", &[]).await?;
        rows.iter().map(decode_row).collect()
    }

    /// Read-modify-write status update on a Job (§5): the control-plane
    /// store is read-only from this gateway except for Job/Execution status
    /// fields, so a whole-document overwrite after an in-memory mutation is
    /// simpler than a bespoke `jsonb_set` path per field.
    pub async fn save_job(&self, job: &SyncJob) -> Result<(), GatewayError> {
        let doc = serde_json::to_value(job).map_err(|e| GatewayError::MalformedRow(e.to_string()))?;
        self.client
            .execute("UPDATE syncjobs SET document = $2 WHERE id = $1", &[&job.id.to_string(), &doc])
            .await?;
        Ok(())
    }

    pub async fn insert_execution(&self, execution: &JobExecution) -> Result<(), GatewayError> {
        let doc = serde_json::to_value(execution).map_err(|e| GatewayError::MalformedRow(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO job_executions (id, document) VALUES ($1, $2)",
                &[&execution.id.to_string(), &doc],
            )
            .await?;
        Ok(())
    }

    /// Compare-set on `status = 'running'` (§5): a concurrently-abandoned
    /// Execution cannot be resurrected to `completed` by a straggling
    /// worker that hasn't noticed the timeout yet.
    pub async fn finish_execution_if_running(&self, execution: &JobExecution) -> Result<bool, GatewayError> {
        let doc = serde_json::to_value(execution).map_err(|e| GatewayError::MalformedRow(e.to_string()))?;
        let rows = self
            .client
            .execute(
                "UPDATE job_executions SET document = $2 WHERE id = $1 AND document->>'status' = 'running'",
                &[&execution.id.to_string(), &doc],
            )
            .await?;
        Ok(rows > 0)
    }

    pub async fn touch_execution_heartbeat(&self, id: Id) -> Result<(), GatewayError> {
        self.client
            .execute(
                "UPDATE job_executions SET document = jsonb_set(document, '{lastHeartbeat}', to_jsonb(now()))
                 WHERE id = $1 AND document->>'status' = 'running'",
                &[&id.to_string()],
            )
            .await?;
        Ok(())
    }

    /// Steals an expired lock the same `INSERT ... ON CONFLICT` way a fresh
    /// one is claimed (§5): the `WHERE` clause on the `DO UPDATE` branch is
    /// what makes the steal conditional on the existing lock being stale.
    pub async fn try_acquire_job_lock(&self, job_id: Id, worker_id: &str, ttl: Duration) -> Result<bool, GatewayError> {
        let rows = self
            .client
            .execute(
                "INSERT INTO job_execution_locks (job_id, worker_id, expires_at)
                 VALUES ($1, $2, now() + make_interval(secs => $3))
                 ON CONFLICT (job_id) DO UPDATE SET worker_id = EXCLUDED.worker_id, expires_at = EXCLUDED.expires_at
                 WHERE job_execution_locks.expires_at < now()",
                &[&job_id.to_string(), &worker_id, &(ttl.as_secs() as f64)],
            )
            .await?;
        Ok(rows > 0)
    }

    pub async fn release_job_lock(&self, job_id: Id, worker_id: &str) -> Result<(), GatewayError> {
        self.client
            .execute(
                "DELETE FROM job_execution_locks WHERE job_id = $1 AND worker_id = $2",
                &[&job_id.to_string(), &worker_id],
            )
            .await?;
        Ok(())
    }

    pub async fn delete_expired_locks(&self) -> Result<u64, GatewayError> {
        Ok(self
            .client
            .execute("DELETE FROM job_execution_locks WHERE expires_at < now()", &[])
            .await?)
    }

    /// Cleanup sweep (§4.6.1): any `running` Execution whose heartbeat
    /// predates `heartbeat_timeout` is marked `abandoned` with
    /// `error.code = "WORKER_TIMEOUT"`.
    pub async fn abandon_stale_executions(&self, heartbeat_timeout: Duration) -> Result<u64, GatewayError> {
        Ok(self
            .client
            .execute(
                "UPDATE job_executions SET document = document
                    || jsonb_build_object('status', 'abandoned')
                    || jsonb_build_object('error', jsonb_build_object('message', 'worker heartbeat timed out', 'code', 'WORKER_TIMEOUT'))
                 WHERE document->>'status' = 'running'
                   AND (document->>'lastHeartbeat')::timestamptz < now() - make_interval(secs => $1)",
                &[&heartbeat_timeout.as_secs_f64()],
            )
            .await?)
    }

    pub async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), GatewayError> {
        let doc = serde_json::to_value(event).map_err(|e| GatewayError::MalformedRow(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO webhook_events (id, document) VALUES ($1, $2)",
                &[&event.id.to_string(), &doc],
            )
            .await?;
        Ok(())
    }

    pub async fn get_webhook_event(&self, id: Id) -> Result<WebhookEvent, GatewayError> {
        let row = self
            .client
            .query_opt("SELECT document FROM webhook_events WHERE id = $1", &[&id.to_string()])
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("webhook event {id}")))?;
        decode_row(&row)
    }

    pub async fn save_webhook_event(&self, event: &WebhookEvent) -> Result<(), GatewayError> {
        let doc = serde_json::to_value(event).map_err(|e| GatewayError::MalformedRow(e.to_string()))?;
        self.client
            .execute("UPDATE webhook_events SET document = $2 WHERE id = $1", &[&event.id.to_string(), &doc])
            .await?;
        Ok(())
    }

    /// Polled by the consumer loop's own intake sweep (§4.7): events an
    /// external HTTP receiver persisted as `pending` since the last poll.
    pub async fn list_pending_webhook_events(&self, limit: i64) -> Result<Vec<WebhookEvent>, GatewayError> {
        let rows = self
            .client
            .query(
                "SELECT document FROM webhook_events
                 WHERE document->>'status' = 'pending'
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Retry sweep (§4.7): up to `limit` failed events with `attempts < 5`.
    pub async fn list_failed_webhook_events_for_retry(&self, limit: i64) -> Result<Vec<WebhookEvent>, GatewayError> {
        let rows = self
            .client
            .query(
                "SELECT document FROM webhook_events
                 WHERE document->>'status' = 'failed' AND (document->>'attempts')::int < 5
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Daily cleanup (§4.7): deletes `completed` events older than `max_age`.
    pub async fn delete_old_completed_webhook_events(&self, max_age: Duration) -> Result<u64, GatewayError> {
        Ok(self
            .client
            .execute(
                "DELETE FROM webhook_events
                 WHERE document->>'status' = 'completed'
                   AND (document->>'processedAt')::timestamptz < now() - make_interval(secs => $1)",
                &[&max_age.as_secs_f64()],
            )
            .await?)
    }

    fn decrypt_connector(&self, mut connector: Connector) -> Result<Connector, GatewayError> {
        let schema =
            schema_for(&connector.kind).ok_or_else(|| GatewayError::ConfigInvalid(connector.kind.clone()))?;
        connector.config = decrypt_config(&connector.config, schema, &|ct| self.cipher.decrypt(ct).ok())?;
        Ok(connector)
    }

    /// `connection.connectionString` and `connection.database` are always
    /// decrypted (§4.1), regardless of connector type.
    fn decrypt_destination(&self, mut dest: Destination) -> Result<Destination, GatewayError> {
        dest.connection.connection_string = self
            .cipher
            .decrypt(&dest.connection.connection_string)
            .map_err(|_| {
                GatewayError::DecryptFailed(SchemaWalkError::DecryptFailed("connection.connectionString".into()))
            })?;
        dest.connection.database = self
            .cipher
            .decrypt(&dest.connection.database)
            .map_err(|_| GatewayError::DecryptFailed(SchemaWalkError::DecryptFailed("connection.database".into())))?;
        Ok(dest)
    }
}

fn decode_row<T: serde::de::DeserializeOwned>(row: &tokio_postgres::Row) -> Result<T, GatewayError> {
    let doc: Value = row.try_get("document")?;
    serde_json::from_value(doc).map_err(|e| GatewayError::MalformedRow(e.to_string()))
}

// Silence unused-field lints for connection being constructed by tests only.
#[allow(dead_code)]
fn _assert_shapes(_: DestinationConnection) {}
