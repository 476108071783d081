//! BigQuery connector (§4.4): `jobs.query`/`pageToken` cursor pagination,
//! RS256 service-account JWT minting for the OAuth2 token exchange, and
//! schema-typed row decoding (`RECORD`/`REPEATED` included) instead of
//! treating every cell as a string.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::connector::{
    Connector, ConnectorMetadata, ExtractedWebhookData, FetchError, FetchOptions, FetchProgress,
    RawRecord, RecordBatch, ResumableFetchOptions, TestConnectionResult, ValidationResult,
};
use crate::fetch::with_retry;
use crate::model::{ConnectorConfig, FetchState};

const SUPPORTED_ENTITIES: &[&str] = &["query"];
const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery.readonly";

#[derive(Debug, Clone, serde::Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct BigQueryConnector {
    project_id: String,
    query: String,
    service_account: Option<ServiceAccountKey>,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
    max_retries: u32,
    rate_limit_delay_ms: u64,
}

impl BigQueryConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        let service_account = config
            .config
            .get("serviceAccountKey")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_str::<ServiceAccountKey>(s).ok());

        BigQueryConnector {
            project_id: config
                .config
                .get("projectId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            query: config
                .config
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            service_account,
            client: reqwest::Client::new(),
            token: Mutex::new(None),
            max_retries: config.settings.max_retries,
            rate_limit_delay_ms: config.settings.rate_limit_delay_ms,
        }
    }

    fn mint_assertion(sa: &ServiceAccountKey) -> Result<String, FetchError> {
        let now = chrono::Utc::now().timestamp();
        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "RS256", "typ": "JWT"}).to_string());
        let claims = URL_SAFE_NO_PAD.encode(
            json!({
                "iss": sa.client_email,
                "scope": BIGQUERY_SCOPE,
                "aud": sa.token_uri,
                "iat": now,
                "exp": now + 3600,
            })
            .to_string(),
        );
        let signing_input = format!("{header}.{claims}");

        let private_key = RsaPrivateKey::from_pkcs8_pem(&sa.private_key)
            .map_err(|e| FetchError::Upstream(format!("invalid service account private key: {e}")))?;
        let signing_key = SigningKey::<Sha256>::new(private_key);
        let signature = signing_key.sign(signing_input.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{signing_input}.{sig_b64}"))
    }

    async fn exchange_token(&self, sa: &ServiceAccountKey) -> Result<String, FetchError> {
        let assertion = Self::mint_assertion(sa)?;
        let response = self
            .client
            .post(&sa.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &assertion),
            ])
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(FetchError::Upstream(format!("token exchange returned {status}: {body}")));
        }
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FetchError::PathNotFound("access_token".into()))
    }

    async fn access_token(&self) -> Result<String, FetchError> {
        let sa = self
            .service_account
            .as_ref()
            .ok_or_else(|| FetchError::Upstream("serviceAccountKey is not configured".into()))?;

        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }
        let access_token = self.exchange_token(sa).await?;
        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            // Google tokens are valid for 3600s; refresh a minute early.
            expires_at: Instant::now() + Duration::from_secs(3540),
        });
        Ok(access_token)
    }

    /// Starts a new query job via `projects.queries` (§4.4). Only the first
    /// page of results comes back from this call; further pages must go
    /// through [`Self::get_query_results`] against the returned `jobId`.
    async fn start_query(&self, sql: &str) -> Result<Value, FetchError> {
        let token = self.access_token().await?;
        let url = format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/queries",
            self.project_id
        );
        let body = json!({ "query": sql, "useLegacySql": false });
        let response = self.client.post(&url).bearer_auth(token).json(&body).send().await?;
        self.unwrap_query_response(response).await
    }

    /// `getQueryResults` (§4.4): a `GET` against the job started by
    /// [`Self::start_query`], never another `POST` of the query text.
    async fn get_query_results(&self, job_id: &str, page_token: &str) -> Result<Value, FetchError> {
        let token = self.access_token().await?;
        let mut url = reqwest::Url::parse(&format!(
            "https://bigquery.googleapis.com/bigquery/v2/projects/{}/queries/{job_id}",
            self.project_id
        ))
        .map_err(|e| FetchError::Upstream(e.to_string()))?;
        url.query_pairs_mut().append_pair("pageToken", page_token);
        let response = self.client.get(url).bearer_auth(token).send().await?;
        self.unwrap_query_response(response).await
    }

    async fn unwrap_query_response(&self, response: reqwest::Response) -> Result<Value, FetchError> {
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited(None));
        }
        let parsed: Value = response.json().await?;
        if !status.is_success() {
            return Err(FetchError::Upstream(format!("bigquery query returned {status}")));
        }
        Ok(parsed)
    }
}

/// Recursively decodes one `TableRow` cell against its `TableFieldSchema`,
/// unwrapping `REPEATED` arrays and `RECORD` nesting (§4.4).
fn decode_field(schema_field: &Value, cell_v: &Value) -> Value {
    let mode = schema_field.get("mode").and_then(Value::as_str).unwrap_or("NULLABLE");
    let field_type = schema_field.get("type").and_then(Value::as_str).unwrap_or("STRING");

    if mode == "REPEATED" {
        let items = cell_v.get("v").and_then(Value::as_array).cloned().unwrap_or_default();
        return Value::Array(
            items
                .iter()
                .map(|item| decode_scalar(field_type, schema_field, item.get("v").unwrap_or(&Value::Null)))
                .collect(),
        );
    }
    decode_scalar(field_type, schema_field, cell_v.get("v").unwrap_or(&Value::Null))
}

fn decode_scalar(field_type: &str, schema_field: &Value, v: &Value) -> Value {
    if field_type == "RECORD" || field_type == "STRUCT" {
        let nested_fields = schema_field.get("fields").and_then(Value::as_array).cloned().unwrap_or_default();
        let nested_cells = v.get("f").and_then(Value::as_array).cloned().unwrap_or_default();
        return decode_row(&nested_fields, &nested_cells);
    }
    match v {
        Value::String(s) => match field_type {
            "INTEGER" | "INT64" => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
            "FLOAT" | "FLOAT64" | "NUMERIC" => s.parse::<f64>().map(Value::from).unwrap_or(Value::Null),
            "BOOLEAN" | "BOOL" => s.parse::<bool>().map(Value::from).unwrap_or(Value::Null),
            _ => Value::String(s.clone()),
        },
        other => other.clone(),
    }
}

/// Decodes a full `TableRow`'s `f` array against the query's `schema.fields`.
fn decode_row(fields: &[Value], cells: &[Value]) -> Value {
    let mut obj = serde_json::Map::new();
    for (field, cell) in fields.iter().zip(cells.iter()) {
        if let Some(name) = field.get("name").and_then(Value::as_str) {
            obj.insert(name.to_string(), decode_field(field, cell));
        }
    }
    Value::Object(obj)
}

#[async_trait]
impl Connector for BigQueryConnector {
    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            name: "bigquery",
            version: "1.0.0",
            description: "Google BigQuery",
            supported_entities: SUPPORTED_ENTITIES.to_vec(),
        }
    }

    fn validate_config(&self) -> ValidationResult {
        let mut errors = Vec::new();
        if self.project_id.is_empty() {
            errors.push("projectId is required".to_string());
        }
        if self.query.is_empty() {
            errors.push("query is required".to_string());
        }
        if self.service_account.is_none() {
            errors.push("serviceAccountKey must decode to a valid service account JSON".to_string());
        }
        ValidationResult {
            valid: errors.is_empty(),
            errors,
        }
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.start_query("SELECT 1").await {
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

    /// BigQuery's only "entity" is whatever SQL the job config supplies
    /// elsewhere; `query` is a fixed placeholder advertising the capability.
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
        if opts.base.entity != "query" {
            return Err(FetchError::UnsupportedEntity(opts.base.entity.to_string()));
        }
        if self.query.is_empty() {
            return Err(FetchError::Upstream("query is not configured".into()));
        }

        let job_id = opts
            .state
            .as_ref()
            .and_then(|s| s.metadata.get("jobId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let page_token = opts.state.as_ref().and_then(|s| s.cursor.clone());
        let mut total_processed = opts.state.as_ref().map(|s| s.total_processed).unwrap_or(0);

        // A `since`-level filter is delegated to the operator's own query
        // text (§4.4's "query-level WHERE") rather than injected into
        // arbitrary SQL with an unknown column name; the decoded rows are
        // still passed through `passes_since_filter` below as a fallback.
        let body = match (&job_id, &page_token) {
            (Some(job_id), Some(page_token)) => {
                with_retry(opts.base.max_retries, self.rate_limit_delay_ms, |_attempt| {
                    self.get_query_results(job_id, page_token)
                })
                .await?
            }
            _ => {
                with_retry(opts.base.max_retries, self.rate_limit_delay_ms, |_attempt| self.start_query(&self.query)).await?
            }
        };

        let fields = body
            .get("schema")
            .and_then(|s| s.get("fields"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let rows = body.get("rows").and_then(Value::as_array).cloned().unwrap_or_default();
        let batch_len = rows.len();

        let records: Vec<RawRecord> = rows
            .iter()
            .map(|row| {
                let cells = row.get("f").and_then(Value::as_array).cloned().unwrap_or_default();
                decode_row(&fields, &cells)
            })
            .filter(|decoded| crate::fetch::passes_since_filter(decoded, opts.base.since))
            .map(|decoded| RawRecord {
                natural_id: decoded.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                payload: decoded,
            })
            .collect();

        if !records.is_empty() {
            let _ = opts
                .base
                .sink
                .send(RecordBatch {
                    entity: "query".to_string(),
                    records,
                })
                .await;
        }

        total_processed += batch_len as u64;
        if let Some(progress) = &opts.base.progress {
            let _ = progress.send(FetchProgress {
                current: total_processed,
                total_hint: body.get("totalRows").and_then(Value::as_str).and_then(|s| s.parse().ok()),
            });
        }

        let next_page_token = body.get("pageToken").and_then(Value::as_str).map(str::to_string);
        let has_more = next_page_token.is_some();
        let job_id = body
            .get("jobReference")
            .and_then(|r| r.get("jobId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(job_id);

        Ok(FetchState {
            offset: None,
            page: None,
            cursor: next_page_token,
            total_processed,
            has_more,
            iterations_in_chunk: 1,
            metadata: json!({ "jobId": job_id }),
        })
    }

    fn extract_webhook_data(&self, _payload: &Value) -> Result<ExtractedWebhookData, FetchError> {
        Err(FetchError::Upstream("bigquery connector does not support webhooks".into()))
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
            name: "bigquery".into(),
            kind: "bigquery".into(),
            is_active: true,
            config: json!({"projectId": "proj-1", "query": "SELECT * FROM `proj-1.dataset.table`"}),
            settings: ConnectorSettings::default(),
        }
    }

    #[test]
    fn metadata_name_matches_registry_key() {
        let connector = BigQueryConnector::new(&config());
        assert_eq!(connector.metadata().name, "bigquery");
    }

    #[test]
    fn validate_config_requires_service_account() {
        let connector = BigQueryConnector::new(&config());
        assert!(!connector.validate_config().valid);
    }

    #[test]
    fn validate_config_requires_query() {
        let mut cfg = config();
        cfg.config = json!({"projectId": "proj-1"});
        let connector = BigQueryConnector::new(&cfg);
        let result = connector.validate_config();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("query")));
    }

    #[test]
    fn decode_row_converts_typed_scalars() {
        let fields = vec![
            json!({"name": "count", "type": "INTEGER", "mode": "NULLABLE"}),
            json!({"name": "active", "type": "BOOLEAN", "mode": "NULLABLE"}),
        ];
        let cells = vec![json!({"v": "42"}), json!({"v": "true"})];
        let row = decode_row(&fields, &cells);
        assert_eq!(row, json!({"count": 42, "active": true}));
    }

    #[test]
    fn decode_row_unwraps_repeated_fields() {
        let fields = vec![json!({"name": "tags", "type": "STRING", "mode": "REPEATED"})];
        let cells = vec![json!({"v": [{"v": "a"}, {"v": "b"}]})];
        let row = decode_row(&fields, &cells);
        assert_eq!(row, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn decode_row_recurses_into_record_fields() {
        let fields = vec![json!({
            "name": "address",
            "type": "RECORD",
            "mode": "NULLABLE",
            "fields": [{"name": "city", "type": "STRING", "mode": "NULLABLE"}]
        })];
        let cells = vec![json!({"v": {"f": [{"v": "Springfield"}]}})];
        let row = decode_row(&fields, &cells);
        assert_eq!(row, json!({"address": {"city": "Springfield"}}));
    }
}
