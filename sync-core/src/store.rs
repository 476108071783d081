//! Document-collection operations on the destination (§4.5, §6).
//!
//! "Collections" are realized as Postgres tables with a `document jsonb`
//! column plus plain indexed columns for `id`/`data_source_id`/`synced_at` —
//! the same direct-driver, no-ORM style the teacher's `postgres.rs` uses,
//! generalized from one ad hoc query to the handful of DDL/DML shapes a
//! document-store facade needs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_postgres::Client;

use crate::id::Id;
use crate::model::DestinationRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),
    #[error("invalid collection name `{0}`")]
    InvalidIdentifier(String),
}

impl crate::error::Classify for StoreError {
    fn classify(&self) -> crate::error::ErrorClass {
        crate::error::ErrorClass::Fatal
    }
}

#[derive(Clone)]
pub struct DocumentStore {
    client: Arc<Client>,
}

/// Table/index identifiers are built from connector names and entity names,
/// never from upstream record content, but are still validated before being
/// interpolated into DDL — `tokio_postgres` has no parameter placeholders
/// for identifiers.
fn validate_identifier(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || name.len() > 63
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

impl DocumentStore {
    pub fn new(client: Arc<Client>) -> Self {
        DocumentStore { client }
    }

    /// Escape hatch for integration tests that need to assert on raw table
    /// contents beyond what the facade methods expose.
    #[cfg(feature = "sync-core-tests")]
    pub fn client_for_test(&self) -> &Client {
        &self.client
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        validate_identifier(name)?;
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
                &[&name],
            )
            .await?;
        Ok(row.get(0))
    }

    pub async fn ensure_collection(&self, name: &str) -> Result<(), StoreError> {
        validate_identifier(name)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" (
                id TEXT NOT NULL,
                data_source_id TEXT NOT NULL,
                data_source_name TEXT NOT NULL,
                synced_at TIMESTAMPTZ NOT NULL,
                webhook_event_id TEXT,
                document JSONB NOT NULL
            )"
        );
        self.client.batch_execute(&ddl).await?;
        Ok(())
    }

    /// Index creation failures are warnings, not hard errors (§4.5) — a
    /// missing index degrades query performance, not correctness.
    pub async fn ensure_indexes(&self, name: &str) {
        if validate_identifier(name).is_err() {
            return;
        }
        let statements = [
            format!("CREATE UNIQUE INDEX IF NOT EXISTS \"{name}_id_idx\" ON \"{name}\" (id) WHERE id IS NOT NULL"),
            format!("CREATE UNIQUE INDEX IF NOT EXISTS \"{name}_id_dsid_idx\" ON \"{name}\" (id, data_source_id)"),
            format!("CREATE INDEX IF NOT EXISTS \"{name}_dsid_synced_idx\" ON \"{name}\" (data_source_id, synced_at DESC)"),
        ];
        for stmt in statements {
            if let Err(e) = self.client.batch_execute(&stmt).await {
                log::warn!("index creation failed for {name}: {e}");
            }
        }
    }

    pub async fn drop_if_exists(&self, name: &str) -> Result<(), StoreError> {
        validate_identifier(name)?;
        self.client.batch_execute(&format!("DROP TABLE IF EXISTS \"{name}\"")).await?;
        Ok(())
    }

    /// Atomically replaces `live` with `stage` the way `rename
    /// dropTarget=true` does in a document store (§4.5 step 6).
    pub async fn swap_staging(&self, stage: &str, live: &str) -> Result<(), StoreError> {
        validate_identifier(stage)?;
        validate_identifier(live)?;
        let ddl = format!("DROP TABLE IF EXISTS \"{live}\"; ALTER TABLE \"{stage}\" RENAME TO \"{live}\"");
        self.client.batch_execute(&ddl).await?;
        Ok(())
    }

    /// Unordered bulk upsert (§4.5): one multi-row `INSERT ... ON CONFLICT`
    /// instead of per-row round trips, matching the "any row's failure does
    /// not depend on another row's success/order" intent.
    pub async fn upsert_batch(&self, collection: &str, records: &[DestinationRecord]) -> Result<(), StoreError> {
        validate_identifier(collection)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut params: Vec<Box<dyn tokio_postgres::types::ToSql + Sync + Send>> = Vec::with_capacity(records.len() * 6);
        let mut placeholders = Vec::with_capacity(records.len());
        for (i, r) in records.iter().enumerate() {
            let base = i * 6;
            placeholders.push(format!(
                "(${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6
            ));
            params.push(Box::new(r.id.clone()));
            params.push(Box::new(r.data_source_id.to_string()));
            params.push(Box::new(r.data_source_name.clone()));
            params.push(Box::new(r.synced_at));
            params.push(Box::new(r.webhook_event_id.map(|id| id.to_string())));
            params.push(Box::new(r.document.clone()));
        }

        let sql = format!(
            "INSERT INTO \"{collection}\" (id, data_source_id, data_source_name, synced_at, webhook_event_id, document)
             VALUES {}
             ON CONFLICT (id, data_source_id) DO UPDATE SET
                document = EXCLUDED.document,
                synced_at = EXCLUDED.synced_at,
                data_source_name = EXCLUDED.data_source_name,
                webhook_event_id = EXCLUDED.webhook_event_id",
            placeholders.join(", ")
        );

        let param_refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
            params.iter().map(|p| p.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync)).collect();
        self.client.execute(&sql, &param_refs).await?;
        Ok(())
    }

    pub async fn delete_by_id(&self, collection: &str, id: &str, data_source_id: Id) -> Result<(), StoreError> {
        validate_identifier(collection)?;
        self.client
            .execute(
                &format!("DELETE FROM \"{collection}\" WHERE id = $1 AND data_source_id = $2"),
                &[&id, &data_source_id.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn max_synced_at(&self, collection: &str, data_source_id: Id) -> Result<Option<DateTime<Utc>>, StoreError> {
        validate_identifier(collection)?;
        if !self.table_exists(collection).await? {
            return Ok(None);
        }
        let row = self
            .client
            .query_one(
                &format!("SELECT max(synced_at) FROM \"{collection}\" WHERE data_source_id = $1"),
                &[&data_source_id.to_string()],
            )
            .await?;
        Ok(row.get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_identifier() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn rejects_identifier_starting_with_digit() {
        assert!(validate_identifier("1close_leads").is_err());
    }

    #[test]
    fn rejects_identifier_with_special_characters() {
        assert!(validate_identifier("close-leads; DROP TABLE x").is_err());
    }

    #[test]
    fn accepts_connector_name_entity_shape() {
        assert!(validate_identifier("close_leads_staging").is_ok());
    }
}
