//! PostHog connector (§4.4): entities are HogQL queries; pagination is
//! injected as `LIMIT`/`OFFSET` clauses, and the tabular `{columns,
//! results}` response shape is zipped back into row objects before the rest
//! of the pipeline ever sees it.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::connector::{
    Connector, ConnectorMetadata, ExtractedWebhookData, FetchError, FetchOptions, FetchProgress,
    RawRecord, RecordBatch, ResumableFetchOptions, TestConnectionResult, ValidationResult,
};
use crate::fetch::with_retry;
use crate::model::{ConnectorConfig, FetchState};

const SUPPORTED_ENTITIES: &[&str] = &["events", "persons"];

fn base_query(entity: &str) -> Option<&'static str> {
    match entity {
        "events" => Some("SELECT uuid, event, timestamp, properties, distinct_id FROM events ORDER BY timestamp"),
        "persons" => Some("SELECT id, properties, created_at FROM persons ORDER BY created_at"),
        _ => None,
    }
}

/// Zips `columns` against each row in `results` into a JSON object, the way
/// the HogQL query API's tabular response has to be turned back into
/// record-shaped data for the rest of the fetch pipeline.
fn rows_to_objects(columns: &[Value], results: &[Value]) -> Vec<Value> {
    results
        .iter()
        .filter_map(Value::as_array)
        .map(|row| {
            let mut obj = Map::new();
            for (col, val) in columns.iter().zip(row.iter()) {
                if let Some(name) = col.as_str() {
                    obj.insert(name.to_string(), val.clone());
                }
            }
            Value::Object(obj)
        })
        .collect()
}

#[derive(Debug)]
pub struct PostHogConnector {
    project_id: String,
    api_key: String,
    host: String,
    client: reqwest::Client,
    max_retries: u32,
    rate_limit_delay_ms: u64,
}

impl PostHogConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        PostHogConnector {
            project_id: config
                .config
                .get("projectId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            api_key: config
                .config
                .get("apiKey")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            host: config
                .config
                .get("host")
                .and_then(Value::as_str)
                .unwrap_or("https://app.posthog.com")
                .to_string(),
            client: reqwest::Client::new(),
            max_retries: config.settings.max_retries,
            rate_limit_delay_ms: config.settings.rate_limit_delay_ms,
        }
    }

    async fn run_query(&self, query: &str, limit: u32, offset: u64) -> Result<Value, FetchError> {
        let paginated = format!("{query} LIMIT {limit} OFFSET {offset}");
        let url = format!(
            "{}/api/projects/{}/query/",
            self.host.trim_end_matches('/'),
            self.project_id
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "query": { "kind": "HogQLQuery", "query": paginated } }))
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited(None));
        }
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(FetchError::Upstream(format!("posthog query API returned {status}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl Connector for PostHogConnector {
    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            name: "posthog",
            version: "1.0.0",
            description: "PostHog analytics",
            supported_entities: SUPPORTED_ENTITIES.to_vec(),
        }
    }

    fn validate_config(&self) -> ValidationResult {
        let mut errors = Vec::new();
        if self.project_id.is_empty() {
            errors.push("projectId is required".to_string());
        }
        if self.api_key.is_empty() {
            errors.push("apiKey is required".to_string());
        }
        ValidationResult {
            valid: errors.is_empty(),
            errors,
        }
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.run_query("SELECT 1", 1, 0).await {
            Ok(_) => TestConnectionResult {
                success: true,
                message: "connected".into(),
                details: None,
            },
            Err(e) => TestConnectionResult {
                success: false,
                message: e.to_string(),
                details: None,
            },
        }
    }

    fn get_available_entities(&self) -> Vec<String> {
        SUPPORTED_ENTITIES.iter().map(|s| s.to_string()).collect()
    }

    async fn fetch_entity(&self, mut opts: FetchOptions<'_>) -> Result<(), FetchError> {
        let mut state: Option<FetchState> = None;
        loop {
            let resumable = ResumableFetchOptions {
                base: FetchOptions {
                    entity: opts.entity,
                    batch_size: opts.batch_size,
                    sink: opts.sink.clone(),
                    progress: opts.progress.take(),
                    since: opts.since,
                    rate_limit_delay: opts.rate_limit_delay,
                    max_retries: opts.max_retries,
                },
                max_iterations: u32::MAX,
                state,
            };
            let next_state = self.fetch_entity_chunk(resumable).await?;
            let has_more = next_state.has_more;
            state = Some(next_state);
            if !has_more {
                return Ok(());
            }
        }
    }

    fn supports_resumable_fetching(&self) -> bool {
        true
    }

    async fn fetch_entity_chunk(&self, opts: ResumableFetchOptions<'_>) -> Result<FetchState, FetchError> {
        let query = base_query(opts.base.entity).ok_or_else(|| FetchError::UnsupportedEntity(opts.base.entity.to_string()))?;

        let mut offset = opts.state.as_ref().and_then(|s| s.offset).unwrap_or(0);
        let mut total_processed = opts.state.as_ref().map(|s| s.total_processed).unwrap_or(0);
        let mut iterations = 0u32;
        let mut has_more = true;

        while iterations < opts.max_iterations && has_more {
            let body = with_retry(opts.base.max_retries, self.rate_limit_delay_ms, |_attempt| {
                self.run_query(query, opts.base.batch_size, offset)
            })
            .await?;

            let columns = body.get("columns").and_then(Value::as_array).ok_or_else(|| FetchError::PathNotFound("columns".into()))?;
            let results = body.get("results").and_then(Value::as_array).ok_or_else(|| FetchError::PathNotFound("results".into()))?;
            let objects = rows_to_objects(columns, results);
            let batch_len = objects.len();

            let id_field = if opts.base.entity == "events" { "uuid" } else { "id" };
            let records: Vec<RawRecord> = objects
                .iter()
                .map(|r| RawRecord {
                    natural_id: r.get(id_field).and_then(Value::as_str).unwrap_or_default().to_string(),
                    payload: r.clone(),
                })
                .collect();

            if !records.is_empty() {
                let _ = opts
                    .base
                    .sink
                    .send(RecordBatch {
                        entity: opts.base.entity.to_string(),
                        records,
                    })
                    .await;
            }

            total_processed += batch_len as u64;
            if let Some(progress) = &opts.base.progress {
                let _ = progress.send(FetchProgress {
                    current: total_processed,
                    total_hint: None,
                });
            }

            has_more = crate::fetch::derive_has_more(None, None, batch_len, opts.base.batch_size);
            offset += batch_len as u64;
            iterations += 1;

            if has_more {
                tokio::time::sleep(opts.base.rate_limit_delay).await;
            }
        }

        Ok(FetchState {
            offset: Some(offset),
            page: None,
            cursor: None,
            total_processed,
            has_more,
            iterations_in_chunk: iterations,
            metadata: Value::Null,
        })
    }

    fn extract_webhook_data(&self, _payload: &Value) -> Result<ExtractedWebhookData, FetchError> {
        Err(FetchError::Upstream("posthog connector does not support webhooks".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectorSettings;

    fn config() -> ConnectorConfig {
        ConnectorConfig {
            id: crate::id::Id::new(),
            workspace_id: crate::id::Id::new(),
            name: "posthog".into(),
            kind: "posthog".into(),
            is_active: true,
            config: json!({"projectId": "1", "apiKey": "phx_test", "host": "https://app.posthog.com"}),
            settings: ConnectorSettings::default(),
        }
    }

    #[test]
    fn metadata_name_matches_registry_key() {
        let connector = PostHogConnector::new(&config());
        assert_eq!(connector.metadata().name, "posthog");
    }

    #[test]
    fn rows_zip_into_objects_by_column_name() {
        let columns = vec![json!("id"), json!("name")];
        let results = vec![json!([1, "alice"]), json!([2, "bob"])];
        let objects = rows_to_objects(&columns, &results);
        assert_eq!(objects, vec![json!({"id": 1, "name": "alice"}), json!({"id": 2, "name": "bob"})]);
    }

    #[test]
    fn rows_to_objects_handles_empty_results() {
        assert!(rows_to_objects(&[json!("id")], &[]).is_empty());
    }
}
