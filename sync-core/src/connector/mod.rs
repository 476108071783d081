//! Connector Contract & Registry (C3, §4.3).
//!
//! Every connector implements [`Connector`] as an `async_trait`. Dispatch
//! across connector types is a tagged sum (§9): [`Registry`] is a
//! `type -> constructor` map populated eagerly at `init`, not a dynamic
//! module loader — lazy loading is only required in interpreted targets.

pub mod bigquery;
pub mod close;
pub mod graphql;
pub mod posthog;
pub mod rest;
pub mod stripe;

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::model::{ConnectorConfig, FetchState, RawRecord};

#[derive(Debug, Clone)]
pub struct ConnectorMetadata {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub supported_entities: Vec<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TestConnectionResult {
    pub success: bool,
    pub message: String,
    pub details: Option<Value>,
}

/// A batch of records plus the fetch progress so far, sent over the
/// channel `onBatch`/`onProgress` become per §4.3 and §9's "cooperative
/// async chaining" guidance.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub entity: String,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchProgress {
    pub current: u64,
    pub total_hint: Option<u64>,
}

pub struct FetchOptions<'a> {
    pub entity: &'a str,
    pub batch_size: u32,
    pub sink: mpsc::Sender<RecordBatch>,
    pub progress: Option<tokio::sync::watch::Sender<FetchProgress>>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub rate_limit_delay: std::time::Duration,
    pub max_retries: u32,
}

pub struct ResumableFetchOptions<'a> {
    pub base: FetchOptions<'a>,
    pub max_iterations: u32,
    pub state: Option<FetchState>,
}

#[derive(Debug, Clone)]
pub struct WebhookVerifyRequest<'a> {
    pub payload: &'a [u8],
    pub headers: &'a HashMap<String, String>,
    pub secret: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOperation {
    Upsert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WebhookEventMapping {
    pub entity: String,
    pub operation: WebhookOperation,
}

#[derive(Debug, Clone)]
pub struct ExtractedWebhookData {
    pub natural_id: String,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("upstream returned an error: {0}")]
    Upstream(String),
    #[error("expected JSON path `{0}` not found in response")]
    PathNotFound(String),
    #[error("pagination did not terminate within the safety cap")]
    PaginationCycle,
    #[error("entity `{0}` is not supported by this connector")]
    UnsupportedEntity(String),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Option<std::time::Duration>),
}

impl crate::error::Classify for FetchError {
    fn classify(&self) -> crate::error::ErrorClass {
        use crate::error::ErrorClass;
        match self {
            FetchError::Http(e) => crate::error::classify_reqwest_error(e),
            FetchError::RateLimited(retry_after) => ErrorClass::Retryable {
                retry_after: *retry_after,
            },
            FetchError::Upstream(_) | FetchError::PathNotFound(_) | FetchError::PaginationCycle
            | FetchError::UnsupportedEntity(_) => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookVerifyError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("missing signature header `{0}`")]
    MissingHeader(String),
}

/// The capability set every connector implements (§4.3). Webhook methods
/// default to "unsupported"; only connectors that override them advertise
/// `supports_webhooks() == true`.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn metadata(&self) -> ConnectorMetadata;

    fn validate_config(&self) -> ValidationResult;

    async fn test_connection(&self) -> TestConnectionResult;

    /// May be narrower than `metadata().supported_entities` (e.g. GraphQL
    /// derives this from the user's configured queries).
    fn get_available_entities(&self) -> Vec<String>;

    async fn fetch_entity(&self, opts: FetchOptions<'_>) -> Result<(), FetchError>;

    fn supports_resumable_fetching(&self) -> bool {
        false
    }

    async fn fetch_entity_chunk(&self, _opts: ResumableFetchOptions<'_>) -> Result<FetchState, FetchError> {
        unimplemented!("connector advertises supports_resumable_fetching() == false")
    }

    fn supports_webhooks(&self) -> bool {
        false
    }

    fn verify_webhook(&self, _req: WebhookVerifyRequest<'_>) -> Result<(), WebhookVerifyError> {
        Err(WebhookVerifyError::InvalidSignature)
    }

    fn get_webhook_event_mapping(&self, _event_type: &str) -> Option<WebhookEventMapping> {
        None
    }

    fn get_supported_webhook_events(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn extract_webhook_data(&self, _payload: &Value) -> Result<ExtractedWebhookData, FetchError> {
        Err(FetchError::Upstream("connector does not support webhooks".into()))
    }
}

pub type ConnectorConstructor = fn(&ConnectorConfig) -> Box<dyn Connector>;

#[derive(Debug, thiserror::Error)]
#[error("unknown connector type `{0}`")]
pub struct UnknownConnectorType(pub String);

/// Process-global, read-mostly (§4.3): `init()` populates the map once,
/// `get_connector` only ever reads it afterward.
pub struct Registry {
    constructors: HashMap<&'static str, ConnectorConstructor>,
}

impl Registry {
    fn with_defaults() -> Self {
        let mut constructors: HashMap<&'static str, ConnectorConstructor> = HashMap::new();
        constructors.insert("close", |cfg| Box::new(close::CloseConnector::new(cfg)));
        constructors.insert("stripe", |cfg| Box::new(stripe::StripeConnector::new(cfg)));
        constructors.insert("graphql", |cfg| Box::new(graphql::GraphQlConnector::new(cfg)));
        constructors.insert("rest", |cfg| Box::new(rest::RestConnector::new(cfg)));
        constructors.insert("posthog", |cfg| Box::new(posthog::PostHogConnector::new(cfg)));
        constructors.insert("bigquery", |cfg| Box::new(bigquery::BigQueryConnector::new(cfg)));
        Registry { constructors }
    }

    pub fn get_connector(&self, config: &ConnectorConfig) -> Result<Box<dyn Connector>, UnknownConnectorType> {
        let ctor = self
            .constructors
            .get(config.kind.as_str())
            .ok_or_else(|| UnknownConnectorType(config.kind.clone()))?;
        Ok(ctor(config))
    }

    pub fn known_types(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Registers all six connectors. Idempotent; safe to call once at process
/// start from both `syncd` and `synccli`.
pub fn init() {
    REGISTRY.get_or_init(Registry::with_defaults);
}

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::with_defaults)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectorSettings;

    fn config(kind: &str) -> ConnectorConfig {
        ConnectorConfig {
            id: crate::id::Id::new(),
            workspace_id: crate::id::Id::new(),
            name: "test".into(),
            kind: kind.into(),
            is_active: true,
            config: Value::Null,
            settings: ConnectorSettings::default(),
        }
    }

    #[test]
    fn registry_knows_all_six_connector_types() {
        let registry = registry();
        let mut types = registry.known_types();
        types.sort();
        assert_eq!(types, vec!["bigquery", "close", "graphql", "posthog", "rest", "stripe"]);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = registry();
        let err = registry.get_connector(&config("sharepoint")).unwrap_err();
        assert_eq!(err.0, "sharepoint");
    }

    #[test]
    fn each_registered_type_constructs() {
        let registry = registry();
        for kind in registry.known_types() {
            let connector = registry.get_connector(&config(kind)).unwrap();
            assert_eq!(connector.metadata().name, kind);
        }
    }
}
