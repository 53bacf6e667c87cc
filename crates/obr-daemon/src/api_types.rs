//! Request/response DTOs for the HTTP surface, plus the error-to-status
//! mapping. 4xx bodies are always `{"error": "<message>"}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use obr_error::OpsError;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: &'static str,
    pub schema_version: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsListQuery {
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub r#type: Option<String>,
    pub tag: Option<String>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub limit: Option<i64>,
    pub format: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceCreateRequest {
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRunRequest {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewCreateRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub query: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewQueryRequest {
    #[serde(default)]
    pub filters: Value,
    pub limit: Option<i64>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobCreateRequest {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsListQuery {
    pub tag: Option<String>,
    pub after: Option<String>,
    pub before: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackRequest {
    pub tag: String,
    pub out_dir: String,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Handler error: an `OpsError` plus the HTTP status it maps to.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "Not found".to_string(),
        }
    }
}

impl From<OpsError> for ApiError {
    fn from(err: OpsError) -> Self {
        // Every error kind surfaces as 400; responses never carry backtraces.
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
