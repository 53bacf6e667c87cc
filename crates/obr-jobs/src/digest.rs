//! `daily_digest`: one markdown digest per workspace-timezone day, built by
//! merging the day window into a saved view.

use std::collections::BTreeMap;
use std::fs;

use chrono::NaiveDate;
use chrono_tz::Tz;
use rusqlite::Connection;
use serde_json::{json, Value};

use obr_db::{merge_view_query, query_events, SearchSettings, ViewFilters};
use obr_error::{OpsError, Result};
use obr_schemas::{QueryFormat, QueryOrder};

use crate::{emit_artifact_event, require_str, JobContext};

const DIGEST_LIMIT: i64 = 500;
const TOP_TAGS: usize = 10;
const SAMPLES: usize = 10;

/// Run the digest: config `{view, day (YYYY-MM-DD), out_dir, tags?}`.
pub fn run(
    conn: &mut Connection,
    ctx: &JobContext<'_>,
    job_name: &str,
    config: &Value,
) -> Result<Value> {
    let view_name = require_str(config, "view")?;
    let day_str = require_str(config, "day")?;
    let out_dir = require_str(config, "out_dir")?;
    let extra_tags: Vec<String> = config
        .get("tags")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let tz = ctx.config.tz()?;
    let (after, before) = day_window(day_str, tz)?;

    let view = obr_db::get_view(conn, view_name)?
        .ok_or_else(|| OpsError::Other(format!("View not found: {view_name}")))?;
    let request = ViewFilters {
        after: Some(after.clone()),
        before: Some(before.clone()),
        ..Default::default()
    };
    let merged = merge_view_query(&view.query, &request, Some(QueryOrder::Desc));
    let params = merged.into_params(DIGEST_LIMIT, QueryFormat::Summary);
    let settings = SearchSettings {
        fts: ctx.config.index.fts,
        max_snippet_len: ctx.config.index.max_snippet_len,
    };
    let rows = query_events(conn, &settings, &params)?;

    let out_abs = ctx.paths.workspace.join(out_dir);
    fs::create_dir_all(&out_abs)
        .map_err(|e| OpsError::Io(format!("Failed to create {}: {e}", out_abs.display())))?;
    let digest_path = out_abs.join("daily_digest.md");
    fs::write(&digest_path, render_markdown(day_str, &rows))
        .map_err(|e| OpsError::Io(format!("Failed to write {}: {e}", digest_path.display())))?;

    let mut tags = vec!["digest".to_string()];
    for tag in extra_tags {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    let artifact_event_id = emit_artifact_event(
        conn,
        ctx,
        job_name,
        &[digest_path.clone()],
        tags,
        format!("Daily digest for {day_str} ({} events)", rows.len()),
        json!({
            "job": "daily_digest",
            "day": day_str,
            "view": view_name,
            "events": rows.len(),
        }),
    )?;

    Ok(json!({
        "day": day_str,
        "view": view_name,
        "events": rows.len(),
        "path": digest_path.to_string_lossy(),
        "artifact_event_id": artifact_event_id,
    }))
}

/// `[day 00:00, day+1 00:00)` as zoned ISO strings in the workspace zone.
pub fn day_window(day: &str, tz: Tz) -> Result<(String, String)> {
    let date = NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|_| OpsError::Other(format!("Invalid day (want YYYY-MM-DD): {day}")))?;
    let start = zoned_midnight(date, tz)?;
    let next = date
        .succ_opt()
        .ok_or_else(|| OpsError::Other(format!("Day out of range: {day}")))?;
    let end = zoned_midnight(next, tz)?;
    Ok((start, end))
}

fn zoned_midnight(date: NaiveDate, tz: Tz) -> Result<String> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| OpsError::Other("Invalid midnight".to_string()))?;
    naive
        .and_local_timezone(tz)
        .earliest()
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, false))
        .ok_or_else(|| OpsError::Other(format!("Ambiguous local midnight for {date}")))
}

fn render_markdown(day: &str, rows: &[Value]) -> String {
    let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_tag: BTreeMap<String, usize> = BTreeMap::new();
    for row in rows {
        if let Some(t) = row["type"].as_str() {
            *by_type.entry(t.to_string()).or_default() += 1;
        }
        if let Some(tags) = row["tags"].as_array() {
            for tag in tags.iter().filter_map(Value::as_str) {
                *by_tag.entry(tag.to_string()).or_default() += 1;
            }
        }
    }
    let mut type_counts: Vec<(String, usize)> = by_type.into_iter().collect();
    type_counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut tag_counts: Vec<(String, usize)> = by_tag.into_iter().collect();
    tag_counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut md = String::new();
    md.push_str(&format!("# Daily Digest {day}\n\n"));
    md.push_str(&format!("Total events: {}\n\n", rows.len()));

    md.push_str("## Counts by type\n\n");
    if type_counts.is_empty() {
        md.push_str("(none)\n");
    }
    for (name, count) in &type_counts {
        md.push_str(&format!("- {name}: {count}\n"));
    }
    md.push('\n');

    md.push_str("## Top tags\n\n");
    if tag_counts.is_empty() {
        md.push_str("(none)\n");
    }
    for (name, count) in tag_counts.iter().take(TOP_TAGS) {
        md.push_str(&format!("- {name}: {count}\n"));
    }
    md.push('\n');

    md.push_str("## Samples\n\n");
    for row in rows.iter().take(SAMPLES) {
        let ts = row["ts"].as_str().unwrap_or("");
        let snippet = row["snippet"].as_str().unwrap_or("");
        md.push_str(&format!("- {ts} {}\n", snippet.replace('\n', " ")));
    }
    md
}
