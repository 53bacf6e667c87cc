//! Axum router and handlers for the opsd HTTP surface.
//!
//! `build_router` is the single entry point; `main.rs` (and `ops serve`)
//! attach middleware afterwards so tests can drive the bare router with
//! `tower::ServiceExt::oneshot`. Google-style `:verb` suffixes (e.g.
//! `/v1/sources/{name}:test`) arrive as one path segment and are split by
//! `split_verb` because router params cannot carry a suffix.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use obr_db::{merge_view_query, query_events, ViewFilters};
use obr_schemas::{
    BatchOptions, IngestSummary, JobDef, QueryFormat, QueryOrder, QueryParams, SourceDef, ViewDef,
    DEFAULT_QUERY_LIMIT, SCHEMA_VERSION,
};

use crate::api_types::{
    ApiError, ApiResult, ArtifactsListQuery, EventsListQuery, HealthResponse, IngestRunRequest,
    JobCreateRequest, PackRequest, SourceCreateRequest, ViewCreateRequest, ViewQueryRequest,
};
use crate::state::ServerContext;

const ARTIFACT_LIST_LIMIT: i64 = 200;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/events:batch", post(events_batch))
        .route("/v1/events", get(events_list))
        .route("/v1/events/{id}", get(event_show))
        .route("/v1/sources", post(sources_create).get(sources_list))
        .route(
            "/v1/sources/{name}",
            get(source_show).delete(source_delete).post(source_verb),
        )
        .route("/v1/ingests/{name}", post(ingest_verb))
        .route("/v1/views", post(views_create).get(views_list))
        .route(
            "/v1/views/{name}",
            get(view_show).delete(view_delete).post(view_verb),
        )
        .route("/v1/jobs", post(jobs_create).get(jobs_list))
        .route(
            "/v1/jobs/{name}",
            get(job_show).delete(job_delete).post(job_verb),
        )
        .route("/v1/jobs/{name}/runs", get(job_runs))
        .route("/v1/artifacts", get(artifacts_list))
        .route("/v1/artifacts:pack", post(artifacts_pack))
        .fallback(not_found)
        .with_state(ctx)
}

/// Split `name:verb` out of a path segment; `None` when the verb is absent
/// or the name is empty.
fn split_verb<'s>(segment: &'s str, verb: &str) -> Option<&'s str> {
    let name = segment.strip_suffix(verb)?.strip_suffix(':')?;
    (!name.is_empty()).then_some(name)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|_| ApiError::bad_request("Invalid JSON"))
}

fn csv_list(raw: Option<&String>) -> Option<Vec<String>> {
    let raw = raw?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

fn parse_format(raw: Option<&str>) -> QueryFormat {
    match raw {
        Some("full") => QueryFormat::Full,
        _ => QueryFormat::Summary,
    }
}

fn parse_order(raw: Option<&str>) -> Option<QueryOrder> {
    match raw {
        Some("asc") => Some(QueryOrder::Asc),
        Some("desc") => Some(QueryOrder::Desc),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        schema_version: SCHEMA_VERSION,
    })
}

// ---------------------------------------------------------------------------
// POST /v1/events:batch
// ---------------------------------------------------------------------------

async fn events_batch(
    State(ctx): State<Arc<ServerContext>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let payload = body(payload)?;
    let events = payload
        .get("events")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::bad_request("events must be a list"))?
        .clone();
    let options: BatchOptions = payload
        .get("options")
        .map(|o| serde_json::from_value(o.clone()))
        .transpose()
        .map_err(|_| ApiError::bad_request("Invalid options"))?
        .unwrap_or_default();

    let _guard = ctx.write_lock.lock().await;
    let mut conn = ctx.connect()?;
    let response = obr_pipeline::ingest_batch(
        &mut conn,
        &ctx.paths,
        ctx.tz()?,
        &events,
        &obr_pipeline::IngestOptions {
            dedupe: options.dedupe,
            dry_run: false,
        },
    );
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// GET /v1/events, GET /v1/events/{id}
// ---------------------------------------------------------------------------

async fn events_list(
    State(ctx): State<Arc<ServerContext>>,
    Query(query): Query<EventsListQuery>,
) -> ApiResult<impl IntoResponse> {
    let params = QueryParams {
        q: query.q.clone().filter(|s| !s.is_empty()),
        types: csv_list(query.r#type.as_ref()),
        tags: csv_list(query.tag.as_ref()),
        after: query.after.clone(),
        before: query.before.clone(),
        limit: query.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
        format: parse_format(query.format.as_deref()),
        order: parse_order(query.order.as_deref()).unwrap_or(QueryOrder::Desc),
    };
    let conn = ctx.connect()?;
    let items = query_events(&conn, &ctx.search_settings(), &params)?;
    Ok(Json(json!({"items": items})))
}

async fn event_show(
    State(ctx): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    let event = obr_db::fetch_event(&conn, &id)?.ok_or_else(ApiError::not_found)?;
    Ok(Json(obr_db::event_value(&event)?))
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

async fn sources_create(
    State(ctx): State<Arc<ServerContext>>,
    payload: Result<Json<SourceCreateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = body(payload)?;
    if request.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let source = SourceDef {
        name: request.name,
        kind: request
            .kind
            .unwrap_or_else(|| obr_adapters::CHAT_JSON_KIND.to_string()),
        config: if request.config.is_null() {
            json!({})
        } else {
            request.config
        },
        tags: request.tags,
        created_at: obr_ids::iso_now(ctx.tz()?),
    };
    let _guard = ctx.write_lock.lock().await;
    let conn = ctx.connect()?;
    obr_db::upsert_source(&conn, &source)?;
    Ok(Json(serde_json::to_value(&source).unwrap_or(Value::Null)))
}

async fn sources_list(State(ctx): State<Arc<ServerContext>>) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    let items = obr_db::list_sources(&conn)?;
    Ok(Json(json!({"items": items})))
}

async fn source_show(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    let source = obr_db::get_source(&conn, &name)?.ok_or_else(ApiError::not_found)?;
    Ok(Json(serde_json::to_value(&source).unwrap_or(Value::Null)))
}

async fn source_delete(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let _guard = ctx.write_lock.lock().await;
    let conn = ctx.connect()?;
    if !obr_db::delete_source(&conn, &name)? {
        return Err(ApiError::not_found());
    }
    Ok(Json(json!({"ok": true})))
}

/// POST /v1/sources/{name}:test validates `config.path` by loading it.
async fn source_verb(
    State(ctx): State<Arc<ServerContext>>,
    Path(segment): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let name = split_verb(&segment, "test").ok_or_else(ApiError::not_found)?;
    let conn = ctx.connect()?;
    let source = obr_db::get_source(&conn, name)?.ok_or_else(ApiError::not_found)?;
    let path = source
        .config
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(Json(json!({"ok": false, "error": "config.path is required"})));
    }
    match obr_adapters::iter_chat_messages(std::path::Path::new(path)) {
        Ok(messages) => Ok(Json(json!({"ok": true, "messages": messages.len()}))),
        Err(err) => Ok(Json(json!({"ok": false, "error": err.to_string()}))),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/ingests/{name}:run
// ---------------------------------------------------------------------------

async fn ingest_verb(
    State(ctx): State<Arc<ServerContext>>,
    Path(segment): Path<String>,
    payload: Result<Json<IngestRunRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let name = split_verb(&segment, "run")
        .ok_or_else(ApiError::not_found)?
        .to_string();
    let request = body(payload)?;

    let _guard = ctx.write_lock.lock().await;
    let mut conn = ctx.connect()?;
    let source = obr_db::get_source(&conn, &name)?.ok_or_else(ApiError::not_found)?;
    let drafts = obr_adapters::build_source_drafts(&source, &request.tags, &ctx.config)?;
    let response = obr_pipeline::ingest_batch(
        &mut conn,
        &ctx.paths,
        ctx.tz()?,
        &obr_pipeline::drafts_to_values(&drafts),
        &obr_pipeline::IngestOptions {
            dedupe: true,
            dry_run: request.dry_run,
        },
    );
    Ok(Json(serde_json::to_value(IngestSummary::from(&response)).unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

async fn views_create(
    State(ctx): State<Arc<ServerContext>>,
    payload: Result<Json<ViewCreateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = body(payload)?;
    if request.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let view = ViewDef {
        name: request.name,
        description: request.description,
        query: request.query,
        created_at: obr_ids::iso_now(ctx.tz()?),
    };
    let _guard = ctx.write_lock.lock().await;
    let conn = ctx.connect()?;
    obr_db::upsert_view(&conn, &view)?;
    Ok(Json(serde_json::to_value(&view).unwrap_or(Value::Null)))
}

async fn views_list(State(ctx): State<Arc<ServerContext>>) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    let items = obr_db::list_views(&conn)?;
    Ok(Json(json!({"items": items})))
}

async fn view_show(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    let view = obr_db::get_view(&conn, &name)?.ok_or_else(ApiError::not_found)?;
    Ok(Json(serde_json::to_value(&view).unwrap_or(Value::Null)))
}

async fn view_delete(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let _guard = ctx.write_lock.lock().await;
    let conn = ctx.connect()?;
    if !obr_db::delete_view(&conn, &name)? {
        return Err(ApiError::not_found());
    }
    Ok(Json(json!({"ok": true})))
}

/// POST /v1/views/{name}:query merges request filters into the stored view.
async fn view_verb(
    State(ctx): State<Arc<ServerContext>>,
    Path(segment): Path<String>,
    payload: Result<Json<ViewQueryRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let name = split_verb(&segment, "query")
        .ok_or_else(ApiError::not_found)?
        .to_string();
    let request = body(payload)?;

    let conn = ctx.connect()?;
    let view = obr_db::get_view(&conn, &name)?.ok_or_else(ApiError::not_found)?;
    let filters = ViewFilters::from_value(&request.filters);
    let merged = merge_view_query(&view.query, &filters, parse_order(request.order.as_deref()));
    let params = merged.into_params(
        request.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
        QueryFormat::Summary,
    );
    let items = query_events(&conn, &ctx.search_settings(), &params)?;
    Ok(Json(json!({"items": items})))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn jobs_create(
    State(ctx): State<Arc<ServerContext>>,
    payload: Result<Json<JobCreateRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = body(payload)?;
    if request.name.is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }
    let job = JobDef {
        name: request.name,
        kind: request.kind,
        config: if request.config.is_null() {
            json!({})
        } else {
            request.config
        },
        enabled: request.enabled,
        created_at: obr_ids::iso_now(ctx.tz()?),
    };
    let _guard = ctx.write_lock.lock().await;
    let conn = ctx.connect()?;
    obr_db::upsert_job(&conn, &job)?;
    Ok(Json(serde_json::to_value(&job).unwrap_or(Value::Null)))
}

async fn jobs_list(State(ctx): State<Arc<ServerContext>>) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    let items = obr_db::list_jobs(&conn)?;
    Ok(Json(json!({"items": items})))
}

async fn job_show(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    let job = obr_db::get_job(&conn, &name)?.ok_or_else(ApiError::not_found)?;
    Ok(Json(serde_json::to_value(&job).unwrap_or(Value::Null)))
}

async fn job_delete(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let _guard = ctx.write_lock.lock().await;
    let conn = ctx.connect()?;
    if !obr_db::delete_job(&conn, &name)? {
        return Err(ApiError::not_found());
    }
    Ok(Json(json!({"ok": true})))
}

/// POST /v1/jobs/{name}:run executes now; the run row carries the outcome.
async fn job_verb(
    State(ctx): State<Arc<ServerContext>>,
    Path(segment): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let name = split_verb(&segment, "run")
        .ok_or_else(ApiError::not_found)?
        .to_string();

    let _guard = ctx.write_lock.lock().await;
    let mut conn = ctx.connect()?;
    let job = obr_db::get_job(&conn, &name)?.ok_or_else(ApiError::not_found)?;
    let run = obr_jobs::run_job(&mut conn, &ctx.job_context(), &job)?;
    Ok(Json(serde_json::to_value(&run).unwrap_or(Value::Null)))
}

async fn job_runs(
    State(ctx): State<Arc<ServerContext>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let conn = ctx.connect()?;
    if obr_db::get_job(&conn, &name)?.is_none() {
        return Err(ApiError::not_found());
    }
    let items = obr_db::list_job_runs(&conn, &name)?;
    Ok(Json(json!({"items": items})))
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

async fn artifacts_list(
    State(ctx): State<Arc<ServerContext>>,
    Query(query): Query<ArtifactsListQuery>,
) -> ApiResult<impl IntoResponse> {
    let params = QueryParams {
        types: Some(vec!["artifact.created".to_string()]),
        tags: query.tag.clone().map(|t| vec![t]),
        after: query.after.clone(),
        before: query.before.clone(),
        limit: ARTIFACT_LIST_LIMIT,
        format: QueryFormat::Full,
        order: QueryOrder::Desc,
        ..QueryParams::default()
    };
    let conn = ctx.connect()?;
    let events = query_events(&conn, &ctx.search_settings(), &params)?;
    let items: Vec<Value> = events.iter().map(obr_jobs::artifact_from_event).collect();
    Ok(Json(json!({"items": items})))
}

async fn artifacts_pack(
    State(ctx): State<Arc<ServerContext>>,
    payload: Result<Json<PackRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = body(payload)?;
    if request.tag.is_empty() || request.out_dir.is_empty() {
        return Err(ApiError::bad_request("tag and out_dir are required"));
    }
    let _guard = ctx.write_lock.lock().await;
    let mut conn = ctx.connect()?;
    let output = obr_jobs::pack::run(&mut conn, &ctx.job_context(), &request.tag, &request.out_dir)?;
    Ok(Json(output))
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Not found"})))
}
