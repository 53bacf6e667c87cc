//! Shared data model for opsbrain: the canonical event shape, ingest drafts,
//! metadata records (sources/views/jobs/job runs) and the batch DTOs that
//! cross the HTTP boundary.
//!
//! `Event` field order matters: it is the order persisted to the canonical
//! log, with `created_at` (index-only) skipped when absent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "0.2";

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSource {
    pub kind: String,
    pub locator: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefDigest {
    pub algo: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRef {
    pub kind: String,
    pub uri: String,
    #[serde(default)]
    pub span: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<RefDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHash {
    pub algo: String,
    pub value: String,
}

/// A fully materialized event. Serialized verbatim as one canonical-log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub schema_version: String,
    pub ts: String,
    pub r#type: String,
    pub source: EventSource,
    pub refs: Vec<EventRef>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub text: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub id: String,
    pub hash: EventHash,
    pub dedupe_key: Option<String>,
    /// Insertion wall clock; lives in the index, not in the log line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Input to the pipeline: an event minus everything the pipeline derives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub schema_version: String,
    pub ts: String,
    pub r#type: String,
    pub source: EventSource,
    pub refs: Vec<EventRef>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub text: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Batch DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default = "default_true")]
    pub dedupe: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { dedupe: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    /// "inserted" | "skipped" | "failed"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<BatchItem>,
    /// Compatibility aliases consumed by the CLI ingest summary.
    pub new: usize,
    pub errors: Vec<String>,
    pub ids: Vec<String>,
}

/// The shape `ops ingest` prints and `/v1/ingests/{name}:run` returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestSummary {
    pub new: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl From<&BatchResponse> for IngestSummary {
    fn from(batch: &BatchResponse) -> Self {
        Self {
            new: batch.new,
            skipped: batch.skipped,
            failed: batch.failed,
            errors: batch.errors.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDef {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: Value,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    /// "running" | "ok" | "failed"
    pub status: String,
    #[serde(default)]
    pub output: Value,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFormat {
    Summary,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOrder {
    Asc,
    Desc,
}

impl QueryOrder {
    pub fn sql(self) -> &'static str {
        match self {
            QueryOrder::Asc => "ASC",
            QueryOrder::Desc => "DESC",
        }
    }
}

pub const DEFAULT_QUERY_LIMIT: i64 = 50;

/// Resolved inputs to the query engine (after CSV splitting and view merge).
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub q: Option<String>,
    pub types: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub limit: i64,
    pub format: QueryFormat,
    pub order: QueryOrder,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            q: None,
            types: None,
            tags: None,
            after: None,
            before: None,
            limit: DEFAULT_QUERY_LIMIT,
            format: QueryFormat::Summary,
            order: QueryOrder::Desc,
        }
    }
}
