//! Event ingest pipeline.
//!
//! Per draft: validate, derive the dedupe key, check the dedupe table, build
//! the event core + hash + id, append to the canonical log (the commit
//! point), then insert into the index in one transaction. Failures are
//! per-draft result values; the batch always continues. An index failure
//! after a successful log append stays failed in the response but the event
//! is durable in the log and `index_rebuild` recovers it.

use chrono_tz::Tz;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use obr_config::WorkspacePaths;
use obr_ids::{dedupe_key_from_draft, event_hash_hex, generate_ulid, iso_now, HASH_ALGO};
use obr_schemas::{BatchItem, BatchResponse, Event, EventDraft, EventHash};

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Skip drafts whose dedupe key is already retained.
    pub dedupe: bool,
    /// Validate and hash but leave the log and index untouched.
    pub dry_run: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            dedupe: true,
            dry_run: false,
        }
    }
}

/// Process one batch of type-erased drafts in receive order.
///
/// The caller is responsible for write serialization (daemon write mutex or
/// the offline CLI lock); this function assumes it is the only writer.
pub fn ingest_batch(
    conn: &mut Connection,
    paths: &WorkspacePaths,
    tz: Tz,
    drafts: &[Value],
    opts: &IngestOptions,
) -> BatchResponse {
    let created_at = iso_now(tz);
    let mut response = BatchResponse::default();

    for draft in drafts {
        let item = process_draft(conn, paths, draft, opts, &created_at);
        match item.status.as_str() {
            "inserted" => {
                response.inserted += 1;
                if let Some(id) = &item.event_id {
                    response.ids.push(id.clone());
                }
            }
            "skipped" => response.skipped += 1,
            _ => {
                response.failed += 1;
                if let Some(err) = &item.error {
                    response.errors.push(err.clone());
                }
            }
        }
        response.results.push(item);
    }
    response.new = response.inserted;

    debug!(
        inserted = response.inserted,
        skipped = response.skipped,
        failed = response.failed,
        dry_run = opts.dry_run,
        "batch processed"
    );
    response
}

fn failed(error: String, dedupe_key: Option<String>) -> BatchItem {
    BatchItem {
        status: "failed".to_string(),
        event_id: None,
        existing_event_id: None,
        dedupe_key,
        hash: None,
        error: Some(error),
    }
}

fn process_draft(
    conn: &mut Connection,
    paths: &WorkspacePaths,
    draft: &Value,
    opts: &IngestOptions,
    created_at: &str,
) -> BatchItem {
    if let Some(error) = validate_draft(draft) {
        return failed(error, None);
    }

    let dedupe_key = dedupe_key_from_draft(draft);
    let is_chat = draft.get("type").and_then(Value::as_str) == Some("chat.message");
    if opts.dedupe && is_chat && dedupe_key.is_none() {
        return failed("Unable to compute dedupe_key".to_string(), None);
    }

    if opts.dedupe {
        if let Some(key) = &dedupe_key {
            match obr_db::find_dedupe(conn, key) {
                Ok(Some(existing)) => {
                    return BatchItem {
                        status: "skipped".to_string(),
                        event_id: None,
                        existing_event_id: Some(existing),
                        dedupe_key: dedupe_key.clone(),
                        hash: None,
                        error: None,
                    }
                }
                Ok(None) => {}
                Err(err) => return failed(err.to_string(), dedupe_key.clone()),
            }
        }
    }

    let typed: EventDraft = match serde_json::from_value(draft.clone()) {
        Ok(typed) => typed,
        Err(err) => return failed(format!("Invalid draft: {err}"), dedupe_key),
    };

    let core = event_core(&typed);
    let hash_value = event_hash_hex(&core);
    let event = Event {
        schema_version: typed.schema_version,
        ts: typed.ts,
        r#type: typed.r#type,
        source: typed.source,
        refs: typed.refs,
        tags: typed.tags,
        text: typed.text,
        payload: typed.payload,
        id: generate_ulid(),
        hash: EventHash {
            algo: HASH_ALGO.to_string(),
            value: hash_value.clone(),
        },
        dedupe_key: dedupe_key.clone(),
        created_at: None,
    };

    if !opts.dry_run {
        if let Err(err) = obr_canonical::append_event(&paths.events, &event) {
            return failed(err.to_string(), dedupe_key);
        }
        if let Err(err) = obr_db::insert_event(conn, &event, created_at) {
            // The log append already committed; rebuild is the remediation.
            warn!(event_id = %event.id, error = %err, "index insert failed after log append");
            return failed(err.to_string(), dedupe_key);
        }
    }

    BatchItem {
        status: "inserted".to_string(),
        event_id: Some(event.id),
        existing_event_id: None,
        dedupe_key,
        hash: Some(hash_value),
        error: None,
    }
}

/// The hashed field set: everything except `id`, `hash`, `dedupe_key`.
fn event_core(draft: &EventDraft) -> Value {
    let mut core = Map::new();
    core.insert("schema_version".into(), Value::String(draft.schema_version.clone()));
    core.insert("ts".into(), Value::String(draft.ts.clone()));
    core.insert("type".into(), Value::String(draft.r#type.clone()));
    core.insert(
        "source".into(),
        serde_json::to_value(&draft.source).unwrap_or(Value::Null),
    );
    core.insert(
        "refs".into(),
        serde_json::to_value(&draft.refs).unwrap_or(Value::Null),
    );
    core.insert(
        "tags".into(),
        serde_json::to_value(&draft.tags).unwrap_or(Value::Null),
    );
    core.insert("text".into(), Value::String(draft.text.clone()));
    core.insert("payload".into(), Value::Object(draft.payload.clone()));
    Value::Object(core)
}

/// Mirror of the draft contract: structural errors become per-draft result
/// messages, never batch-level failures.
pub fn validate_draft(draft: &Value) -> Option<String> {
    let obj = match draft.as_object() {
        Some(obj) => obj,
        None => return Some("Event draft must be an object".to_string()),
    };
    for key in ["schema_version", "ts", "type", "source", "refs", "text", "payload"] {
        if !obj.contains_key(key) {
            return Some(format!("Missing {key}"));
        }
    }
    let source = match obj["source"].as_object() {
        Some(source) => source,
        None => return Some("source must be an object".to_string()),
    };
    let has_kind = source.get("kind").and_then(Value::as_str).is_some_and(|s| !s.is_empty());
    let has_locator = source
        .get("locator")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty());
    if !has_kind || !has_locator {
        return Some("source.kind and source.locator are required".to_string());
    }
    if !obj["refs"].is_array() {
        return Some("refs must be a list".to_string());
    }
    if !obj["text"].is_string() {
        return Some("text must be a string".to_string());
    }
    if !obj["payload"].is_object() {
        return Some("payload must be an object".to_string());
    }
    None
}

/// Convenience for callers holding typed drafts from the adapters.
pub fn drafts_to_values(drafts: &[EventDraft]) -> Vec<Value> {
    drafts
        .iter()
        .map(|d| serde_json::to_value(d).unwrap_or(Value::Null))
        .collect()
}
