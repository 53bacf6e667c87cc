//! `artifact_pack`: bundle every event carrying a tag into a directory with
//! a pretty-printed pack.json, a short README and digest-renamed copies of
//! the files referenced by `artifact.created` items.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde_json::{json, Value};

use obr_db::{query_events, SearchSettings};
use obr_error::{OpsError, Result};
use obr_schemas::{QueryFormat, QueryOrder, QueryParams};

use crate::{emit_artifact_event, JobContext};

const PACK_LIMIT: i64 = 500;
const README_LINES: usize = 20;

pub fn run(conn: &mut Connection, ctx: &JobContext<'_>, tag: &str, out_dir: &str) -> Result<Value> {
    let params = QueryParams {
        tags: Some(vec![tag.to_string()]),
        limit: PACK_LIMIT,
        format: QueryFormat::Full,
        order: QueryOrder::Desc,
        ..QueryParams::default()
    };
    let settings = SearchSettings {
        fts: ctx.config.index.fts,
        max_snippet_len: ctx.config.index.max_snippet_len,
    };
    let items = query_events(conn, &settings, &params)?;

    let out_abs = ctx.paths.workspace.join(out_dir);
    fs::create_dir_all(&out_abs)
        .map_err(|e| OpsError::Io(format!("Failed to create {}: {e}", out_abs.display())))?;

    let assets = copy_assets(&items, &out_abs)?;

    let pack_path = out_abs.join("pack.json");
    let pack = json!({
        "tag": tag,
        "items": items,
        "assets": assets,
    });
    let pretty = serde_json::to_string_pretty(&pack)
        .map_err(|e| OpsError::Other(format!("JSON encode error: {e}")))?;
    fs::write(&pack_path, format!("{pretty}\n"))
        .map_err(|e| OpsError::Io(format!("Failed to write {}: {e}", pack_path.display())))?;

    let readme_path = out_abs.join("README.md");
    fs::write(&readme_path, render_readme(tag, &items))
        .map_err(|e| OpsError::Io(format!("Failed to write {}: {e}", readme_path.display())))?;

    let artifact_event_id = emit_artifact_event(
        conn,
        ctx,
        "artifact_pack",
        &[pack_path.clone(), readme_path.clone()],
        vec![tag.to_string(), "artifact-pack".to_string()],
        format!("Artifact pack for tag {tag} ({} items)", items.len()),
        json!({
            "job": "artifact_pack",
            "tag": tag,
            "items": items.len(),
            "assets": assets.len(),
        }),
    )?;

    Ok(json!({
        "pack_path": pack_path.to_string_lossy(),
        "readme_path": readme_path.to_string_lossy(),
        "assets": assets,
        "items": items.len(),
        "artifact_event_id": artifact_event_id,
    }))
}

/// Copy files referenced by `artifact.created` items into `assets/`, renamed
/// `<first12-of-sha256>_<basename>`. Missing referents are skipped.
fn copy_assets(items: &[Value], out_abs: &Path) -> Result<Vec<String>> {
    let assets_dir = out_abs.join("assets");
    let mut assets = Vec::new();
    for item in items {
        if item["type"].as_str() != Some("artifact.created") {
            continue;
        }
        let refs = match item["refs"].as_array() {
            Some(refs) => refs,
            None => continue,
        };
        for r in refs {
            let uri = match r["uri"].as_str() {
                Some(uri) => uri,
                None => continue,
            };
            let Some(path) = uri.strip_prefix("file:") else {
                continue;
            };
            let src = PathBuf::from(path);
            let Ok(bytes) = fs::read(&src) else {
                continue;
            };
            let digest = obr_ids::sha256_hex(&bytes);
            let basename = src
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "asset".to_string());
            fs::create_dir_all(&assets_dir).map_err(|e| {
                OpsError::Io(format!("Failed to create {}: {e}", assets_dir.display()))
            })?;
            let dest = assets_dir.join(format!("{}_{basename}", &digest[..12]));
            fs::write(&dest, bytes)
                .map_err(|e| OpsError::Io(format!("Failed to write {}: {e}", dest.display())))?;
            assets.push(dest.to_string_lossy().to_string());
        }
    }
    Ok(assets)
}

fn render_readme(tag: &str, items: &[Value]) -> String {
    let mut md = format!("# Artifact pack: {tag}\n\n");
    for item in items.iter().take(README_LINES) {
        let ts = item["ts"].as_str().unwrap_or("");
        let kind = item["type"].as_str().unwrap_or("");
        let text = item["text"].as_str().unwrap_or("");
        let line: String = text.replace('\n', " ").chars().take(80).collect();
        md.push_str(&format!("- {ts} [{kind}] {line}\n"));
    }
    md
}

/// Project an `artifact.created` event into the artifact listing shape.
pub fn artifact_from_event(event: &Value) -> Value {
    let files: Vec<String> = event["refs"]
        .as_array()
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r["uri"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    json!({
        "id": event["id"],
        "ts": event["ts"],
        "tags": event["tags"],
        "files": files,
        "text": event["text"],
    })
}
