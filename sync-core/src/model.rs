//! Persisted and ephemeral entities (§3).
//!
//! These are plain serde structs backed by `jsonb` columns in the
//! control-plane store (§6); [`crate::gateway`] is the only place that
//! reads them off the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::id::Id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Id,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        ConnectorSettings {
            batch_size: default_batch_size(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            timezone: default_timezone(),
        }
    }
}

fn default_batch_size() -> u32 {
    100
}
fn default_rate_limit_delay_ms() -> u64 {
    250
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_timezone() -> String {
    "UTC".to_string()
}

/// The `config` bag is type-specific and may carry ciphertext leaves; see
/// [`crate::crypto`] and [`crate::gateway`] for the decrypt walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: Id,
    pub workspace_id: Id,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub is_active: bool,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub settings: ConnectorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConnection {
    pub connection_string: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: Id,
    pub workspace_id: Id,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub connection: DestinationConnection,
}

fn default_kind() -> String {
    "documentStore".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedule {
    pub cron: String,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Id,
    pub workspace_id: Id,
    pub connector_id: Id,
    pub destination_id: Id,
    pub schedule: JobSchedule,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub entity_filter: Vec<String>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSystem {
    pub worker_id: String,
    pub host: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    #[serde(default)]
    pub records_processed: u64,
    #[serde(default)]
    pub entities: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Id,
    pub job_id: Id,
    pub workspace_id: Id,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: ExecutionStatus,
    pub success: bool,
    pub error: Option<ExecutionError>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub context: Value,
    pub stats: Option<ExecutionStats>,
    pub system: ExecutionSystem,
}

impl JobExecution {
    pub fn new(job: &SyncJob, system: ExecutionSystem) -> Self {
        let now = Utc::now();
        JobExecution {
            id: Id::new(),
            job_id: job.id,
            workspace_id: job.workspace_id,
            started_at: now,
            last_heartbeat: now,
            completed_at: None,
            duration_ms: None,
            status: ExecutionStatus::Running,
            success: false,
            error: None,
            logs: Vec::new(),
            context: serde_json::json!({
                "syncMode": job.sync_mode,
                "entityFilter": job.entity_filter,
            }),
            stats: None,
            system,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Id,
    pub job_id: Id,
    pub event_id: String,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub status: WebhookEventStatus,
    /// Request headers captured at ingest time, needed again at processing
    /// time for signature verification (`verifyWebhook` reads them).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub raw_payload: Value,
    pub error: Option<ExecutionError>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_duration_ms: Option<i64>,
}

/// Ephemeral per-chunk resumption state (§3, §4.4). Never persisted outside
/// of the owning [`SyncJob`]'s execution context snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchState {
    pub offset: Option<u64>,
    pub page: Option<u64>,
    pub cursor: Option<String>,
    #[serde(default)]
    pub total_processed: u64,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub iterations_in_chunk: u32,
    #[serde(default)]
    pub metadata: Value,
}

/// A record as extracted from upstream, keyed by its natural id, before the
/// write-path wrap step (§9) stamps on `_dataSourceId`/`_syncedAt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub natural_id: String,
    pub payload: Value,
}

/// The document actually written to a collection (§3's "Destination
/// Record"): the upstream payload plus sync metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub id: String,
    pub data_source_id: Id,
    pub data_source_name: String,
    pub synced_at: DateTime<Utc>,
    pub webhook_event_id: Option<Id>,
    pub document: Value,
}

impl DestinationRecord {
    /// The "wrap" step from §9: turns an upstream payload into an opaque
    /// document the write path doesn't need to know the shape of.
    pub fn wrap(
        raw: RawRecord,
        data_source_id: Id,
        data_source_name: &str,
        synced_at: DateTime<Utc>,
        webhook_event_id: Option<Id>,
    ) -> Self {
        DestinationRecord {
            id: raw.natural_id,
            data_source_id,
            data_source_name: data_source_name.to_string(),
            synced_at,
            webhook_event_id,
            document: raw.payload,
        }
    }
}
