//! Chat-JSON file adapter: the one external record shape the pipeline
//! consumes. Accepts a JSON array of objects or newline-delimited objects,
//! each `{ts?, speaker?, content (required), thread_id?}`, and turns them
//! into event drafts in file order.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use obr_config::OpsConfig;
use obr_error::{OpsError, Result};
use obr_ids::iso_from_system_time;
use obr_schemas::{EventDraft, EventRef, EventSource, SourceDef, SCHEMA_VERSION};

pub const CHAT_JSON_KIND: &str = "chat_json_file";

// ---------------------------------------------------------------------------
// File parsing
// ---------------------------------------------------------------------------

/// Load a chat-JSON file: a JSON array, or one JSON object per line.
pub fn load_chat_json(path: &Path) -> Result<Vec<Value>> {
    let text = fs::read_to_string(path)
        .map_err(|e| OpsError::Adapter(format!("Failed to read input {}: {e}", path.display())))?;
    let stripped = text.trim_start();
    if stripped.is_empty() {
        return Ok(Vec::new());
    }
    if stripped.starts_with('[') {
        let data: Value = serde_json::from_str(&text)
            .map_err(|e| OpsError::Adapter(format!("Invalid JSON input: {e}")))?;
        return match data {
            Value::Array(items) => Ok(items),
            _ => Err(OpsError::Adapter("chat_json must be a JSON array".to_string())),
        };
    }
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| OpsError::Adapter(format!("Invalid JSON input: {e}")))?;
        entries.push(value);
    }
    Ok(entries)
}

/// `(idx, message)` pairs in file order; every entry must be an object.
pub fn iter_chat_messages(path: &Path) -> Result<Vec<(usize, Map<String, Value>)>> {
    let entries = load_chat_json(path)?;
    let mut out = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        match entry {
            Value::Object(map) => out.push((idx, map)),
            _ => {
                return Err(OpsError::Adapter(
                    "chat_json entries must be objects".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Raw copies
// ---------------------------------------------------------------------------

/// Copy a source file into the raw store as `<first12-of-sha256>_<basename>`.
pub fn copy_into_raw(path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let bytes = fs::read(path)
        .map_err(|e| OpsError::Adapter(format!("Failed to read input {}: {e}", path.display())))?;
    let digest = obr_ids::sha256_hex(&bytes);
    let basename = path
        .file_name()
        .ok_or_else(|| OpsError::Adapter(format!("Input has no file name: {}", path.display())))?;
    let dest = dest_dir.join(format!(
        "{}_{}",
        &digest[..12],
        basename.to_string_lossy()
    ));
    fs::create_dir_all(dest_dir)
        .map_err(|e| OpsError::Io(format!("Failed to create {}: {e}", dest_dir.display())))?;
    fs::write(&dest, bytes)
        .map_err(|e| OpsError::Io(format!("Failed to write {}: {e}", dest.display())))?;
    Ok(dest)
}

// ---------------------------------------------------------------------------
// Draft building
// ---------------------------------------------------------------------------

/// Ordered tag union, de-duplicated by first occurrence.
pub fn merge_tags(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for tag in base.iter().chain(extra.iter()) {
        if !merged.contains(tag) {
            merged.push(tag.clone());
        }
    }
    merged
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| OpsError::Io(format!("Failed to resolve cwd: {e}")))?;
        Ok(cwd.join(path))
    }
}

/// Build `chat.message` drafts from a chat-JSON file. When `copy` is set the
/// file is first mirrored into `raw/chat_json/` and the copy becomes the
/// locator, so the event keeps pointing at an immutable snapshot.
pub fn build_chat_drafts(
    source_path: &Path,
    source_kind: &str,
    tags: &[String],
    config: &OpsConfig,
    copy: bool,
) -> Result<Vec<EventDraft>> {
    let source_path = absolutize(source_path)?;
    let locator_path = if copy {
        let raw_dir = obr_config::WorkspacePaths::resolve(config).raw;
        copy_into_raw(&source_path, &raw_dir)?
    } else {
        source_path.clone()
    };
    let locator = locator_path.to_string_lossy().to_string();
    let tz = config.tz()?;

    let messages = iter_chat_messages(&locator_path)?;
    let mut drafts = Vec::with_capacity(messages.len());
    for (idx, message) in messages {
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| OpsError::Adapter(format!("Missing content at idx {idx}")))?;
        let ts = match message.get("ts").and_then(Value::as_str) {
            Some(ts) if !ts.is_empty() => ts.to_string(),
            _ => {
                let mtime = fs::metadata(&locator_path)
                    .and_then(|m| m.modified())
                    .map_err(|e| OpsError::Adapter(format!("Failed to stat input: {e}")))?;
                iso_from_system_time(mtime, tz)
            }
        };
        let text = content.replace("\r\n", "\n").replace('\r', "\n");
        let mut payload = Map::new();
        payload.insert(
            "speaker".to_string(),
            message.get("speaker").cloned().unwrap_or(Value::Null),
        );
        payload.insert("content".to_string(), Value::String(content.to_string()));
        if let Some(thread_id) = message.get("thread_id") {
            if !thread_id.is_null() {
                payload.insert("thread_id".to_string(), thread_id.clone());
            }
        }
        drafts.push(EventDraft {
            schema_version: SCHEMA_VERSION.to_string(),
            ts,
            r#type: "chat.message".to_string(),
            source: EventSource {
                kind: source_kind.to_string(),
                locator: locator.clone(),
                meta: Map::new(),
            },
            refs: vec![EventRef {
                kind: "file".to_string(),
                uri: format!("file:{locator}"),
                span: json!({"idx": idx}).as_object().cloned().unwrap_or_default(),
                digest: None,
            }],
            tags: tags.to_vec(),
            text,
            payload,
            dedupe_key: None,
        });
    }
    Ok(drafts)
}

/// Build drafts from a stored source definition (`config.path`,
/// `config.copy`, stored tags merged with request tags).
pub fn build_source_drafts(
    source: &SourceDef,
    extra_tags: &[String],
    config: &OpsConfig,
) -> Result<Vec<EventDraft>> {
    let path_value = source
        .config
        .get("path")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OpsError::Other("config.path is required".to_string()))?;
    let copy = source
        .config
        .get("copy")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let tags = merge_tags(&source.tags, extra_tags);
    build_chat_drafts(Path::new(path_value), &source.kind, &tags, config, copy)
}
