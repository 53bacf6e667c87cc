//! Offline command paths: open the index directly, and take the CLI write
//! lock for the local ingest path. Reads never lock.

use std::path::{Path, PathBuf};

use serde_json::Value;

use obr_config::{OpsConfig, WorkspacePaths};
use obr_db::{query_events, query_events_with_fallback, SearchSettings};
use obr_error::{OpsError, Result};
use obr_jobs::rebuild::{RebuildCounts, RebuildOptions};
use obr_lock::{cli_lock_timeout, FileLock};
use obr_schemas::{IngestSummary, QueryParams};

pub struct LocalCtx {
    pub config: OpsConfig,
    pub paths: WorkspacePaths,
}

impl LocalCtx {
    /// Load `ops.yml` from the current directory.
    pub fn load() -> Result<Self> {
        let config = obr_config::load_config(Path::new(obr_config::CONFIG_FILE))?;
        let paths = WorkspacePaths::resolve(&config);
        Ok(Self { config, paths })
    }

    pub fn connect(&self) -> Result<rusqlite::Connection> {
        obr_db::connect(&self.paths.db)
    }

    pub fn settings(&self) -> SearchSettings {
        SearchSettings {
            fts: self.config.index.fts,
            max_snippet_len: self.config.index.max_snippet_len,
        }
    }

    fn job_context(&self) -> obr_jobs::JobContext<'_> {
        obr_jobs::JobContext {
            config: &self.config,
            paths: &self.paths,
        }
    }
}

/// Offline bulk ingest of a chat-JSON file, serialized by `.ops.lock`.
pub fn ingest_chat_json(
    ctx: &LocalCtx,
    path: &str,
    tags: &[String],
    copy: bool,
) -> Result<IngestSummary> {
    let drafts = obr_adapters::build_chat_drafts(
        Path::new(path),
        obr_adapters::CHAT_JSON_KIND,
        tags,
        &ctx.config,
        copy,
    )?;
    ingest_drafts(ctx, &obr_pipeline::drafts_to_values(&drafts), false)
}

/// Offline source ingest (`ingest run --offline`).
pub fn ingest_source(
    ctx: &LocalCtx,
    name: &str,
    extra_tags: &[String],
    dry_run: bool,
) -> Result<IngestSummary> {
    let conn = ctx.connect()?;
    let source = obr_db::get_source(&conn, name)?
        .ok_or_else(|| OpsError::Other("Source not found".to_string()))?;
    drop(conn);
    let drafts = obr_adapters::build_source_drafts(&source, extra_tags, &ctx.config)?;
    ingest_drafts(ctx, &obr_pipeline::drafts_to_values(&drafts), dry_run)
}

fn ingest_drafts(ctx: &LocalCtx, drafts: &[Value], dry_run: bool) -> Result<IngestSummary> {
    let _lock = FileLock::acquire(&ctx.paths.cli_lock, cli_lock_timeout())?;
    let mut conn = ctx.connect()?;
    let response = obr_pipeline::ingest_batch(
        &mut conn,
        &ctx.paths,
        ctx.config.tz()?,
        drafts,
        &obr_pipeline::IngestOptions {
            dedupe: true,
            dry_run,
        },
    );
    Ok(IngestSummary::from(&response))
}

pub fn search(ctx: &LocalCtx, params: &QueryParams, fallback: bool) -> Result<Vec<Value>> {
    let conn = ctx.connect()?;
    if fallback {
        query_events_with_fallback(&conn, &ctx.settings(), params)
    } else {
        query_events(&conn, &ctx.settings(), params)
    }
}

pub fn show_event(ctx: &LocalCtx, id: &str) -> Result<Value> {
    let conn = ctx.connect()?;
    let event = obr_db::fetch_event(&conn, id)?
        .ok_or_else(|| OpsError::Other("Event not found".to_string()))?;
    obr_db::event_value(&event)
}

pub fn rebuild(ctx: &LocalCtx, wipe: bool, fts: bool, from: Option<PathBuf>) -> Result<RebuildCounts> {
    let _lock = FileLock::acquire(&ctx.paths.cli_lock, cli_lock_timeout())?;
    let mut conn = ctx.connect()?;
    obr_jobs::rebuild::run(
        &mut conn,
        &ctx.job_context(),
        &RebuildOptions { wipe, fts, from },
    )
}

pub fn view_query(
    ctx: &LocalCtx,
    name: &str,
    filters: &Value,
    limit: i64,
) -> Result<Vec<Value>> {
    let conn = ctx.connect()?;
    let view = obr_db::get_view(&conn, name)?
        .ok_or_else(|| OpsError::Other("View not found".to_string()))?;
    let merged = obr_db::merge_view_query(&view.query, &obr_db::ViewFilters::from_value(filters), None);
    let params = merged.into_params(limit, obr_schemas::QueryFormat::Summary);
    query_events(&conn, &ctx.settings(), &params)
}

pub fn list_artifacts(
    ctx: &LocalCtx,
    tag: Option<String>,
    after: Option<String>,
    before: Option<String>,
) -> Result<Vec<Value>> {
    let conn = ctx.connect()?;
    let params = QueryParams {
        types: Some(vec!["artifact.created".to_string()]),
        tags: tag.map(|t| vec![t]),
        after,
        before,
        limit: 200,
        format: obr_schemas::QueryFormat::Full,
        ..QueryParams::default()
    };
    let events = query_events(&conn, &ctx.settings(), &params)?;
    Ok(events.iter().map(obr_jobs::artifact_from_event).collect())
}
