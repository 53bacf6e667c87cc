//! Job engine: named job configs dispatched by kind, each execution wrapped
//! in a `job_runs` row (`running` before, `ok`/`failed` once after). Jobs
//! that produce files emit an `artifact.created` event through the regular
//! pipeline so artifacts are queryable like everything else.

use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use obr_config::{OpsConfig, WorkspacePaths};
use obr_error::{OpsError, Result};
use obr_ids::iso_now;
use obr_schemas::{JobDef, JobRun};

pub mod digest;
pub mod pack;
pub mod rebuild;

pub use pack::artifact_from_event;
pub use rebuild::RebuildOptions;

pub const KIND_DAILY_DIGEST: &str = "daily_digest";
pub const KIND_ARTIFACT_PACK: &str = "artifact_pack";
pub const KIND_INDEX_REBUILD: &str = "index_rebuild";

/// Everything a job needs besides the index connection.
pub struct JobContext<'a> {
    pub config: &'a OpsConfig,
    pub paths: &'a WorkspacePaths,
}

/// Execute a job inside a `job_runs` lifecycle row. Job-level failures land
/// in the run record (`status="failed"`); only bookkeeping failures (the run
/// row itself) propagate as errors.
pub fn run_job(conn: &mut Connection, ctx: &JobContext<'_>, job: &JobDef) -> Result<JobRun> {
    let tz = ctx.config.tz()?;
    let mut run = JobRun {
        id: Uuid::new_v4(),
        job_name: job.name.clone(),
        started_at: iso_now(tz),
        finished_at: None,
        status: "running".to_string(),
        output: json!({}),
        error: None,
    };
    obr_db::insert_job_run(conn, &run)?;
    info!(job = %job.name, kind = %job.kind, run_id = %run.id, "job started");

    let outcome = dispatch(conn, ctx, job);
    let finished_at = iso_now(tz);
    match outcome {
        Ok(output) => {
            obr_db::finish_job_run(conn, &run.id, &finished_at, "ok", &output, None)?;
            run.status = "ok".to_string();
            run.output = output;
        }
        Err(err) => {
            let message = err.to_string();
            warn!(job = %job.name, run_id = %run.id, error = %message, "job failed");
            obr_db::finish_job_run(
                conn,
                &run.id,
                &finished_at,
                "failed",
                &json!({}),
                Some(&message),
            )?;
            run.status = "failed".to_string();
            run.error = Some(message);
        }
    }
    run.finished_at = Some(finished_at);
    Ok(run)
}

fn dispatch(conn: &mut Connection, ctx: &JobContext<'_>, job: &JobDef) -> Result<Value> {
    match job.kind.as_str() {
        KIND_DAILY_DIGEST => digest::run(conn, ctx, &job.name, &job.config),
        KIND_ARTIFACT_PACK => {
            let tag = require_str(&job.config, "tag")?;
            let out_dir = require_str(&job.config, "out_dir")?;
            pack::run(conn, ctx, tag, out_dir)
        }
        KIND_INDEX_REBUILD => {
            let opts = RebuildOptions {
                wipe: job.config.get("wipe").and_then(Value::as_bool).unwrap_or(false),
                fts: job.config.get("fts").and_then(Value::as_bool).unwrap_or(false),
                from: None,
            };
            let counts = rebuild::run(conn, ctx, &opts)?;
            Ok(serde_json::to_value(counts)
                .map_err(|e| OpsError::Other(format!("JSON encode error: {e}")))?)
        }
        other => Err(OpsError::Other(format!("Unknown job kind: {other}"))),
    }
}

fn require_str<'v>(config: &'v Value, key: &str) -> Result<&'v str> {
    config
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OpsError::Other(format!("config.{key} is required")))
}

/// Emit an `artifact.created` event for job output files.
pub(crate) fn emit_artifact_event(
    conn: &mut Connection,
    ctx: &JobContext<'_>,
    locator: &str,
    files: &[std::path::PathBuf],
    tags: Vec<String>,
    text: String,
    payload: Value,
) -> Result<String> {
    let tz = ctx.config.tz()?;
    let refs: Vec<Value> = files
        .iter()
        .map(|f| json!({"kind": "file", "uri": format!("file:{}", f.display()), "span": {}}))
        .collect();
    let draft = json!({
        "schema_version": obr_schemas::SCHEMA_VERSION,
        "ts": iso_now(tz),
        "type": "artifact.created",
        "source": {"kind": "job", "locator": locator, "meta": {}},
        "refs": refs,
        "tags": tags,
        "text": text,
        "payload": payload,
    });
    let response = obr_pipeline::ingest_batch(
        conn,
        ctx.paths,
        tz,
        &[draft],
        &obr_pipeline::IngestOptions::default(),
    );
    if response.failed > 0 {
        return Err(OpsError::Other(format!(
            "Failed to emit artifact event: {}",
            response.errors.join("; ")
        )));
    }
    response
        .ids
        .first()
        .cloned()
        .ok_or_else(|| OpsError::Other("Artifact event produced no id".to_string()))
}
