//! Canonical append-only event log (`canonical/events.jsonl`).
//!
//! One JSON object per line. The append + fsync is the commit point of
//! record: the index is regenerable from this file, never the reverse.
//! Readers tolerate blank lines and count (rather than fail on) lines that
//! do not parse.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde_json::Value;

use obr_error::{OpsError, Result};
use obr_schemas::Event;

/// Append one complete event as a single line and fsync the descriptor.
pub fn append_event(path: &Path, event: &Event) -> Result<()> {
    let line = serde_json::to_string(event)
        .map_err(|e| OpsError::Io(format!("Failed to serialize event: {e}")))?;
    append_line(path, &line)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| OpsError::Io(format!("Failed to open canonical log {}: {e}", path.display())))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_all())
        .map_err(|e| OpsError::Io(format!("Failed to append canonical event: {e}")))?;
    Ok(())
}

/// Result of walking a canonical log file.
#[derive(Debug, Default)]
pub struct LogRead {
    pub lines: Vec<Value>,
    pub parse_errors: usize,
}

/// Read every parseable line; blank lines are skipped, bad lines counted.
pub fn read_log(path: &Path) -> Result<LogRead> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| OpsError::Io(format!("Failed to read canonical log {}: {e}", path.display())))?;
    Ok(read_log_str(&content))
}

pub fn read_log_str(content: &str) -> LogRead {
    let mut out = LogRead::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => out.lines.push(value),
            Err(_) => out.parse_errors += 1,
        }
    }
    out
}

/// Count of committed events (non-blank, parseable lines).
pub fn count_events(path: &Path) -> Result<usize> {
    Ok(read_log(path)?.lines.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use obr_schemas::{EventHash, EventSource};

    fn sample_event(id: &str) -> Event {
        Event {
            schema_version: "0.2".to_string(),
            ts: "2026-01-21T10:00:00+09:00".to_string(),
            r#type: "chat.message".to_string(),
            source: EventSource {
                kind: "chat_json_file".to_string(),
                locator: "/tmp/a.json".to_string(),
                meta: Default::default(),
            },
            refs: vec![],
            tags: vec![],
            text: "先抓包再分析协议".to_string(),
            payload: Default::default(),
            id: id.to_string(),
            hash: EventHash {
                algo: "sha256".to_string(),
                value: "0".repeat(64),
            },
            dedupe_key: None,
            created_at: None,
        }
    }

    #[test]
    fn append_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        append_event(&path, &sample_event("A")).unwrap();
        append_event(&path, &sample_event("B")).unwrap();

        let read = read_log(&path).unwrap();
        assert_eq!(read.lines.len(), 2);
        assert_eq!(read.parse_errors, 0);
        assert_eq!(read.lines[0]["id"], "A");
        assert_eq!(read.lines[1]["id"], "B");
        // log lines never carry created_at
        assert!(read.lines[0].get("created_at").is_none());
    }

    #[test]
    fn reader_skips_blanks_and_counts_garbage() {
        let read = read_log_str("{\"id\":\"A\"}\n\n   \nnot json\n{\"id\":\"B\"}\n");
        assert_eq!(read.lines.len(), 2);
        assert_eq!(read.parse_errors, 1);
    }

    #[test]
    fn count_matches_committed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, "").unwrap();
        assert_eq!(count_events(&path).unwrap(), 0);
        append_event(&path, &sample_event("A")).unwrap();
        assert_eq!(count_events(&path).unwrap(), 1);
    }
}
