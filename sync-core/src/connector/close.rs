//! Close CRM connector (§4.4): HTTP Basic auth (api key as username), offset
//! pagination by default, date-window pagination for `activities`.
//!
//! The request-building/envelope-unwrap shape is grounded directly in the
//! teacher's `fivetran::Client`: one `reqwest::Client` built once with
//! default headers, a `base_url` joined per request, and a small
//! `unwrap_envelope` helper that logs status + message before decoding.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};

use crate::connector::{
    Connector, ConnectorMetadata, ExtractedWebhookData, FetchError, FetchOptions, FetchProgress,
    RawRecord, RecordBatch, ResumableFetchOptions, TestConnectionResult, ValidationResult,
    WebhookEventMapping, WebhookOperation, WebhookVerifyError, WebhookVerifyRequest,
};
use crate::fetch::{with_retry, DateWindowState, Transition};
use crate::model::{ConnectorConfig, FetchState};

const SUPPORTED_ENTITIES: &[&str] = &["leads", "contacts", "activities", "users"];

#[derive(Debug)]
pub struct CloseConnector {
    api_key: String,
    client: reqwest::Client,
    base_url: reqwest::Url,
    max_retries: u32,
    rate_limit_delay_ms: u64,
    webhook_secret: Option<String>,
}

impl CloseConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        let api_key = config
            .config
            .get("apiKey")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let webhook_secret = config
            .config
            .get("webhookSecret")
            .and_then(Value::as_str)
            .map(str::to_string);

        CloseConnector {
            api_key,
            client: reqwest::Client::new(),
            base_url: reqwest::Url::parse("https://api.close.com").unwrap(),
            max_retries: config.settings.max_retries,
            rate_limit_delay_ms: config.settings.rate_limit_delay_ms,
            webhook_secret,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.base_url.join(path).unwrap())
            .basic_auth(&self.api_key, Some(""))
    }

    async fn unwrap_envelope(&self, response: reqwest::Response) -> Result<Value, FetchError> {
        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::RateLimited(retry_after));
        }
        let body: Value = response.json().await?;
        if !status.is_success() {
            log::error!("close api error: {status} {body:?}");
            return Err(FetchError::Upstream(format!("close returned {status}")));
        }
        Ok(body)
    }

    /// Full sync: a plain `GET` with `_order_by`. Incremental: `since` must
    /// be pushed server-side via `date_updated>=` (Close has no `updatedAt`
    /// field a client-side filter could check), sent as a `POST` with the
    /// `x-http-method-override: GET` header the way `fetch_activities_page`
    /// already does for its own date-window query.
    async fn fetch_offset_page(
        &self,
        path: &str,
        limit: u32,
        skip: u64,
        order_by: Option<&str>,
        since: Option<chrono::DateTime<Utc>>,
    ) -> Result<Value, FetchError> {
        let Some(since) = since else {
            let mut url = self.base_url.join(path).unwrap();
            {
                let mut qp = url.query_pairs_mut();
                qp.append_pair("_limit", &limit.to_string());
                qp.append_pair("_skip", &skip.to_string());
                if let Some(order_by) = order_by {
                    qp.append_pair("_order_by", order_by);
                }
            }
            let response = self
                .client
                .get(url)
                .basic_auth(&self.api_key, Some(""))
                .send()
                .await?;
            return self.unwrap_envelope(response).await;
        };

        let query = format!("date_updated>=\"{}\"", since.format("%Y-%m-%d"));
        let response = self
            .request(reqwest::Method::POST, path)
            .header("x-http-method-override", "GET")
            .json(&json!({
                "_params": {
                    "_limit": limit,
                    "_skip": skip,
                    "_order_by": "-date_updated",
                    "query": query,
                }
            }))
            .send()
            .await?;
        self.unwrap_envelope(response).await
    }

    async fn fetch_activities_page(
        &self,
        day: NaiveDate,
        limit: u32,
        skip: u64,
    ) -> Result<Value, FetchError> {
        let query = format!("date_created__gte=\"{day}T00:00:00\"&date_created__lt=\"{}T00:00:00\"", day.succ_opt().unwrap());
        let response = self
            .request(reqwest::Method::POST, "/api/v1/activity/")
            .header("x-http-method-override", "GET")
            .json(&json!({
                "_params": {
                    "_limit": limit,
                    "_skip": skip,
                    "_order_by": "-date_created",
                    "query": query,
                }
            }))
            .send()
            .await?;
        self.unwrap_envelope(response).await
    }
}

#[async_trait]
impl Connector for CloseConnector {
    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            name: "close",
            version: "1.0.0",
            description: "Close CRM",
            supported_entities: SUPPORTED_ENTITIES.to_vec(),
        }
    }

    fn validate_config(&self) -> ValidationResult {
        if self.api_key.is_empty() {
            ValidationResult {
                valid: false,
                errors: vec!["apiKey is required".to_string()],
            }
        } else {
            ValidationResult {
                valid: true,
                errors: Vec::new(),
            }
        }
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.request(reqwest::Method::GET, "/api/v1/me/").send().await {
            Ok(r) if r.status().is_success() => TestConnectionResult {
                success: true,
                message: "connected".into(),
                details: None,
            },
            Ok(r) => TestConnectionResult {
                success: false,
                message: format!("close returned {}", r.status()),
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
        if !SUPPORTED_ENTITIES.contains(&opts.base.entity) {
            return Err(FetchError::UnsupportedEntity(opts.base.entity.to_string()));
        }

        if opts.base.entity == "activities" {
            return self.fetch_activities_chunk(opts).await;
        }

        let path = match opts.base.entity {
            "leads" => "/api/v1/lead/",
            "contacts" => "/api/v1/contact/",
            "users" => "/api/v1/user/",
            other => return Err(FetchError::UnsupportedEntity(other.to_string())),
        };
        // Close's /user/ endpoint has no stable orderBy; duplicate
        // deliveries are tolerated via upsert-dedup per §4.4.
        let order_by = if opts.base.entity == "users" { None } else { Some("id") };

        let mut total_processed = opts
            .state
            .as_ref()
            .map(|s| s.total_processed)
            .unwrap_or(0);
        let mut offset = opts.state.and_then(|s| s.offset).unwrap_or(0);
        let mut iterations = 0u32;
        let mut has_more = true;

        while iterations < opts.max_iterations && has_more {
            let body = with_retry(opts.base.max_retries, self.rate_limit_delay_ms, |_attempt| {
                self.fetch_offset_page(path, opts.base.batch_size, offset, order_by, opts.base.since)
            })
            .await?;

            let data = body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| FetchError::PathNotFound("data".into()))?;
            let batch_len = data.len();

            let records: Vec<RawRecord> = data
                .iter()
                .filter(|r| crate::fetch::passes_since_filter(r, opts.base.since))
                .map(|r| RawRecord {
                    natural_id: r.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
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
                    total_hint: body.get("total_results").and_then(Value::as_u64),
                });
            }

            has_more = crate::fetch::derive_has_more(
                body.get("has_more").and_then(Value::as_bool),
                None,
                batch_len,
                opts.base.batch_size,
            );
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

    fn supports_webhooks(&self) -> bool {
        self.webhook_secret.is_some()
    }

    fn verify_webhook(&self, req: WebhookVerifyRequest<'_>) -> Result<(), WebhookVerifyError> {
        let sig = req
            .headers
            .get("close-sig-hash")
            .ok_or_else(|| WebhookVerifyError::MissingHeader("close-sig-hash".into()))?;
        let expected = crate::webhook_sig::hmac_sha256_hex(req.secret, req.payload);
        if crate::crypto::constant_time_eq(sig.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(WebhookVerifyError::InvalidSignature)
        }
    }

    fn get_webhook_event_mapping(&self, event_type: &str) -> Option<WebhookEventMapping> {
        match event_type {
            "lead.created" | "lead.updated" => Some(WebhookEventMapping {
                entity: "leads".into(),
                operation: WebhookOperation::Upsert,
            }),
            "lead.deleted" => Some(WebhookEventMapping {
                entity: "leads".into(),
                operation: WebhookOperation::Delete,
            }),
            "contact.created" | "contact.updated" => Some(WebhookEventMapping {
                entity: "contacts".into(),
                operation: WebhookOperation::Upsert,
            }),
            "contact.deleted" => Some(WebhookEventMapping {
                entity: "contacts".into(),
                operation: WebhookOperation::Delete,
            }),
            _ => None,
        }
    }

    fn get_supported_webhook_events(&self) -> Vec<&'static str> {
        vec![
            "lead.created",
            "lead.updated",
            "lead.deleted",
            "contact.created",
            "contact.updated",
            "contact.deleted",
        ]
    }

    fn extract_webhook_data(&self, payload: &Value) -> Result<ExtractedWebhookData, FetchError> {
        let event = payload.get("event").unwrap_or(payload);
        let data = event
            .get("data")
            .cloned()
            .ok_or_else(|| FetchError::PathNotFound("event.data".into()))?;
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::PathNotFound("event.data.id".into()))?
            .to_string();
        Ok(ExtractedWebhookData { natural_id: id, data })
    }
}

impl CloseConnector {
    async fn fetch_activities_chunk(&self, opts: ResumableFetchOptions<'_>) -> Result<FetchState, FetchError> {
        let starting_day = opts
            .state
            .as_ref()
            .and_then(|s| s.metadata.get("currentDay"))
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .unwrap_or_else(|| Utc::now().date_naive());

        let mut window_state = match opts.state.as_ref().and_then(|s| s.metadata.get("probing")) {
            Some(Value::Bool(true)) => DateWindowState::ProbingOlder { day: starting_day },
            _ => DateWindowState::Normal {
                day: starting_day,
                daily_offset: opts.state.as_ref().and_then(|s| s.offset).unwrap_or(0),
            },
        };

        let mut total_processed = opts.state.as_ref().map(|s| s.total_processed).unwrap_or(0);
        let mut iterations = 0u32;
        let is_full_sync = opts.base.since.is_none();
        let mut done = false;

        while iterations < opts.max_iterations && !done {
            let (day, daily_offset) = match &window_state {
                DateWindowState::Normal { day, daily_offset } => (*day, *daily_offset),
                DateWindowState::ProbingOlder { day } => (*day, 0),
            };

            let body = with_retry(opts.base.max_retries, self.rate_limit_delay_ms, |_attempt| {
                self.fetch_activities_page(day, opts.base.batch_size, daily_offset)
            })
            .await?;

            let data = body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| FetchError::PathNotFound("data".into()))?;
            let page_len = data.len();

            let records: Vec<RawRecord> = data
                .iter()
                .filter(|r| crate::fetch::passes_since_filter(r, opts.base.since))
                .map(|r| RawRecord {
                    natural_id: r.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    payload: r.clone(),
                })
                .collect();

            if !records.is_empty() {
                let _ = opts
                    .base
                    .sink
                    .send(RecordBatch {
                        entity: "activities".to_string(),
                        records,
                    })
                    .await;
            }

            total_processed += page_len as u64;
            iterations += 1;

            match window_state.clone().advance(page_len, opts.base.batch_size, is_full_sync) {
                Transition::Continue(next) => window_state = next,
                Transition::Done => {
                    done = true;
                }
            }

            if !done {
                tokio::time::sleep(opts.base.rate_limit_delay).await;
            }
        }

        let (current_day, daily_offset, probing) = match &window_state {
            DateWindowState::Normal { day, daily_offset } => (*day, *daily_offset, false),
            DateWindowState::ProbingOlder { day } => (*day, 0, true),
        };

        Ok(FetchState {
            offset: Some(daily_offset),
            page: None,
            cursor: None,
            total_processed,
            has_more: !done,
            iterations_in_chunk: iterations,
            metadata: json!({
                "currentDay": current_day.format("%Y-%m-%d").to_string(),
                "probing": probing,
            }),
        })
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
            name: "close".into(),
            kind: "close".into(),
            is_active: true,
            config: json!({"apiKey": "sk-test"}),
            settings: ConnectorSettings::default(),
        }
    }

    #[test]
    fn validate_config_requires_api_key() {
        let mut cfg = config();
        cfg.config = json!({});
        let connector = CloseConnector::new(&cfg);
        assert!(!connector.validate_config().valid);
    }

    #[test]
    fn metadata_name_matches_registry_key() {
        let connector = CloseConnector::new(&config());
        assert_eq!(connector.metadata().name, "close");
    }

    #[test]
    fn users_entity_has_no_order_by() {
        // Documented limitation (§4.4): close has no stable ordering for
        // /user/, so duplicate deliveries are tolerated by upsert-dedup.
        assert_eq!(SUPPORTED_ENTITIES.contains(&"users"), true);
    }

    #[test]
    fn webhook_mapping_covers_crud_pairs() {
        let connector = CloseConnector::new(&config());
        assert!(matches!(
            connector.get_webhook_event_mapping("lead.created"),
            Some(WebhookEventMapping { operation: WebhookOperation::Upsert, .. })
        ));
        assert!(matches!(
            connector.get_webhook_event_mapping("lead.deleted"),
            Some(WebhookEventMapping { operation: WebhookOperation::Delete, .. })
        ));
        assert!(connector.get_webhook_event_mapping("unknown.type").is_none());
    }
}
