//! Stripe connector (§4.4): cursor pagination via `starting_after`, a
//! server-side `created[gte]` incremental filter, and the `t=...,v1=...`
//! webhook signature scheme.

use async_trait::async_trait;
use serde_json::Value;

use crate::connector::{
    Connector, ConnectorMetadata, ExtractedWebhookData, FetchError, FetchOptions, FetchProgress,
    RawRecord, RecordBatch, ResumableFetchOptions, TestConnectionResult, ValidationResult,
    WebhookEventMapping, WebhookOperation, WebhookVerifyError, WebhookVerifyRequest,
};
use crate::fetch::with_retry;
use crate::model::{ConnectorConfig, FetchState};

const SUPPORTED_ENTITIES: &[&str] = &["customers", "charges", "subscriptions", "invoices"];

#[derive(Debug)]
pub struct StripeConnector {
    secret_key: String,
    webhook_secret: Option<String>,
    client: reqwest::Client,
    base_url: reqwest::Url,
    max_retries: u32,
    rate_limit_delay_ms: u64,
}

impl StripeConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        StripeConnector {
            secret_key: config
                .config
                .get("secretKey")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            webhook_secret: config
                .config
                .get("webhookSecret")
                .and_then(Value::as_str)
                .map(str::to_string),
            client: reqwest::Client::new(),
            base_url: reqwest::Url::parse("https://api.stripe.com").unwrap(),
            max_retries: config.settings.max_retries,
            rate_limit_delay_ms: config.settings.rate_limit_delay_ms,
        }
    }

    async fn fetch_page(
        &self,
        entity: &str,
        limit: u32,
        starting_after: Option<&str>,
        created_gte: Option<i64>,
    ) -> Result<Value, FetchError> {
        let mut url = self.base_url.join(&format!("/v1/{entity}")).unwrap();
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("limit", &limit.to_string());
            if let Some(cursor) = starting_after {
                qp.append_pair("starting_after", cursor);
            }
            if let Some(gte) = created_gte {
                qp.append_pair("created[gte]", &gte.to_string());
            }
        }
        let response = self
            .client
            .get(url)
            .basic_auth(&self.secret_key, Some(""))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(FetchError::RateLimited(retry_after));
        }
        let body: Value = response.json().await?;
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown stripe error");
            log::error!("stripe api error: {status} {message}");
            return Err(FetchError::Upstream(message.to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl Connector for StripeConnector {
    fn metadata(&self) -> ConnectorMetadata {
        ConnectorMetadata {
            name: "stripe",
            version: "1.0.0",
            description: "Stripe payments",
            supported_entities: SUPPORTED_ENTITIES.to_vec(),
        }
    }

    fn validate_config(&self) -> ValidationResult {
        if self.secret_key.is_empty() {
            ValidationResult {
                valid: false,
                errors: vec!["secretKey is required".to_string()],
            }
        } else {
            ValidationResult {
                valid: true,
                errors: Vec::new(),
            }
        }
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.fetch_page("customers", 1, None, None).await {
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
        if !SUPPORTED_ENTITIES.contains(&opts.base.entity) {
            return Err(FetchError::UnsupportedEntity(opts.base.entity.to_string()));
        }

        let mut cursor = opts.state.as_ref().and_then(|s| s.cursor.clone());
        let mut total_processed = opts.state.as_ref().map(|s| s.total_processed).unwrap_or(0);
        let created_gte = opts.base.since.map(|t| t.timestamp());
        let mut iterations = 0u32;
        let mut has_more = true;

        while iterations < opts.max_iterations && has_more {
            let body = with_retry(opts.base.max_retries, self.rate_limit_delay_ms, |_attempt| {
                self.fetch_page(opts.base.entity, opts.base.batch_size, cursor.as_deref(), created_gte)
            })
            .await?;

            let data = body
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| FetchError::PathNotFound("data".into()))?;
            let batch_len = data.len();

            let records: Vec<RawRecord> = data
                .iter()
                .map(|r| RawRecord {
                    natural_id: r.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    payload: r.clone(),
                })
                .collect();

            cursor = records.last().map(|r| r.natural_id.clone());

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

            has_more = crate::fetch::derive_has_more(
                body.get("has_more").and_then(Value::as_bool),
                Some(cursor.is_some()),
                batch_len,
                opts.base.batch_size,
            );
            iterations += 1;

            if has_more {
                tokio::time::sleep(opts.base.rate_limit_delay).await;
            }
        }

        Ok(FetchState {
            offset: None,
            page: None,
            cursor,
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
        let header = req
            .headers
            .get("stripe-signature")
            .ok_or_else(|| WebhookVerifyError::MissingHeader("stripe-signature".into()))?;

        let mut timestamp = None;
        let mut signature = None;
        for part in header.split(',') {
            if let Some((k, v)) = part.split_once('=') {
                match k {
                    "t" => timestamp = Some(v),
                    "v1" => signature = Some(v),
                    _ => {}
                }
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(s)) => (t, s),
            _ => return Err(WebhookVerifyError::MissingHeader("stripe-signature".into())),
        };

        let signed_payload = [timestamp.as_bytes(), b".", req.payload].concat();
        let expected = crate::webhook_sig::hmac_sha256_hex(req.secret, &signed_payload);
        if crate::crypto::constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(WebhookVerifyError::InvalidSignature)
        }
    }

    fn get_webhook_event_mapping(&self, event_type: &str) -> Option<WebhookEventMapping> {
        match event_type {
            "customer.created" | "customer.updated" => Some(WebhookEventMapping {
                entity: "customers".into(),
                operation: WebhookOperation::Upsert,
            }),
            "customer.deleted" => Some(WebhookEventMapping {
                entity: "customers".into(),
                operation: WebhookOperation::Delete,
            }),
            "charge.succeeded" | "charge.updated" => Some(WebhookEventMapping {
                entity: "charges".into(),
                operation: WebhookOperation::Upsert,
            }),
            "invoice.created" | "invoice.updated" | "invoice.paid" => Some(WebhookEventMapping {
                entity: "invoices".into(),
                operation: WebhookOperation::Upsert,
            }),
            "customer.subscription.created" | "customer.subscription.updated" => Some(WebhookEventMapping {
                entity: "subscriptions".into(),
                operation: WebhookOperation::Upsert,
            }),
            "customer.subscription.deleted" => Some(WebhookEventMapping {
                entity: "subscriptions".into(),
                operation: WebhookOperation::Delete,
            }),
            _ => None,
        }
    }

    fn get_supported_webhook_events(&self) -> Vec<&'static str> {
        vec![
            "customer.created",
            "customer.updated",
            "customer.deleted",
            "charge.succeeded",
            "charge.updated",
            "invoice.created",
            "invoice.updated",
            "invoice.paid",
            "customer.subscription.created",
            "customer.subscription.updated",
            "customer.subscription.deleted",
        ]
    }

    fn extract_webhook_data(&self, payload: &Value) -> Result<ExtractedWebhookData, FetchError> {
        let object = payload
            .get("data")
            .and_then(|d| d.get("object"))
            .cloned()
            .ok_or_else(|| FetchError::PathNotFound("data.object".into()))?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::PathNotFound("data.object.id".into()))?
            .to_string();
        Ok(ExtractedWebhookData { natural_id: id, data: object })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectorSettings;
    use serde_json::json;

    fn config() -> ConnectorConfig {
        ConnectorConfig {
            id: crate::id::Id::new(),
            workspace_id: crate::id::Id::new(),
            name: "stripe".into(),
            kind: "stripe".into(),
            is_active: true,
            config: json!({"secretKey": "sk_test_123", "webhookSecret": "whsec_test"}),
            settings: ConnectorSettings::default(),
        }
    }

    #[test]
    fn metadata_name_matches_registry_key() {
        let connector = StripeConnector::new(&config());
        assert_eq!(connector.metadata().name, "stripe");
    }

    #[test]
    fn webhook_signature_round_trips() {
        let connector = StripeConnector::new(&config());
        let payload = b"{\"id\":\"evt_1\"}";
        let digest = crate::webhook_sig::hmac_sha256_hex("whsec_test", &[b"1000000000.".as_slice(), payload].concat());
        let mut headers = std::collections::HashMap::new();
        headers.insert("stripe-signature".to_string(), format!("t=1000000000,v1={digest}"));
        let result = connector.verify_webhook(WebhookVerifyRequest {
            payload,
            headers: &headers,
            secret: "whsec_test",
        });
        assert!(result.is_ok());
    }

    #[test]
    fn webhook_signature_rejects_tampering() {
        let connector = StripeConnector::new(&config());
        let mut headers = std::collections::HashMap::new();
        headers.insert("stripe-signature".to_string(), "t=1000000000,v1=deadbeef".to_string());
        let result = connector.verify_webhook(WebhookVerifyRequest {
            payload: b"{}",
            headers: &headers,
            secret: "whsec_test",
        });
        assert!(matches!(result, Err(WebhookVerifyError::InvalidSignature)));
    }

    #[test]
    fn cursor_advances_to_last_record_id() {
        let connector = StripeConnector::new(&config());
        assert_eq!(connector.metadata().supported_entities, SUPPORTED_ENTITIES);
    }
}
