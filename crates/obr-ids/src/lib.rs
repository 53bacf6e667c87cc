//! Identifiers and content hashing.
//!
//! Three derived values anchor the event model:
//! - a 26-char Crockford ULID event id (48-bit ms timestamp + 80 random bits),
//! - the event hash: hex SHA-256 over the canonical JSON of the event core,
//! - the dedupe key: hex SHA-256 over `adapter|locator|idx:N|normalized-text`.
//!
//! Canonical JSON sorts object keys recursively and emits compact separators
//! with UTF-8 preserved, so two semantically equal cores hash byte-for-byte
//! equal across processes.

use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub const HASH_ALGO: &str = "sha256";

// ---------------------------------------------------------------------------
// ULID
// ---------------------------------------------------------------------------

/// Generate a ULID from the current UTC wall clock and fresh entropy.
///
/// Ids generated in different milliseconds sort lexicographically by time;
/// within one millisecond ordering is arbitrary (the random tail decides).
pub fn generate_ulid() -> String {
    let ts_ms = Utc::now().timestamp_millis().max(0) as u64;
    let entropy: u128 = rand::thread_rng().gen::<u128>() & ((1u128 << 80) - 1);
    ulid_from_parts(ts_ms, entropy)
}

/// Assemble a ULID from its raw parts. Split out so tests can pin timestamps.
pub fn ulid_from_parts(ts_ms: u64, entropy: u128) -> String {
    let mut out = String::with_capacity(26);
    encode_base32(ts_ms as u128 & ((1u128 << 48) - 1), 10, &mut out);
    encode_base32(entropy & ((1u128 << 80) - 1), 16, &mut out);
    out
}

fn encode_base32(value: u128, length: usize, out: &mut String) {
    for i in (0..length).rev() {
        let idx = ((value >> (5 * i)) & 0x1f) as usize;
        out.push(CROCKFORD_ALPHABET[idx] as char);
    }
}

/// Check the `^[0-9A-HJKMNP-TV-Z]{26}$` shape without pulling in a regex.
pub fn is_ulid(value: &str) -> bool {
    value.len() == 26 && value.bytes().all(|b| CROCKFORD_ALPHABET.contains(&b))
}

// ---------------------------------------------------------------------------
// Canonical JSON + hashing
// ---------------------------------------------------------------------------

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonicalize by sorting object keys recursively and emitting compact JSON.
pub fn canonical_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization of a Value must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hex SHA-256 over the canonical JSON bytes of an event core.
pub fn event_hash_hex(core: &Value) -> String {
    sha256_hex(canonical_json(core).as_bytes())
}

// ---------------------------------------------------------------------------
// Text normalization + dedupe keys
// ---------------------------------------------------------------------------

/// Line-ending and whitespace normalization applied before dedupe hashing:
/// CRLF/CR become LF, trailing spaces/tabs are trimmed per line, and interior
/// runs of spaces/tabs collapse to a single space.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let joined = unified
        .split('\n')
        .map(|line| line.trim_end_matches([' ', '\t']))
        .collect::<Vec<_>>()
        .join("\n");

    let mut out = String::with_capacity(joined.len());
    let mut in_run = false;
    for ch in joined.chars() {
        if ch == ' ' || ch == '\t' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            in_run = false;
            out.push(ch);
        }
    }
    out
}

pub fn dedupe_key(adapter: &str, locator: &str, idx: i64, content: &str) -> String {
    let material = format!("{adapter}|{locator}|idx:{idx}|{}", normalize_text(content));
    sha256_hex(material.as_bytes())
}

pub fn is_dedupe_key(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Derive the dedupe key for a draft. Only `chat.message` drafts carry one
/// unless the draft supplies `dedupe_key` itself; returns `None` when any
/// ingredient (source kind/locator, refs[0].span.idx, content) is missing.
pub fn dedupe_key_from_draft(draft: &Value) -> Option<String> {
    if let Some(explicit) = draft.get("dedupe_key").and_then(Value::as_str) {
        if !explicit.is_empty() {
            return Some(explicit.to_string());
        }
    }
    if draft.get("type").and_then(Value::as_str) != Some("chat.message") {
        return None;
    }
    let source = draft.get("source")?;
    let adapter = source.get("kind")?.as_str().filter(|s| !s.is_empty())?;
    let locator = source.get("locator")?.as_str().filter(|s| !s.is_empty())?;
    let idx = draft
        .get("refs")?
        .as_array()?
        .first()?
        .get("span")?
        .get("idx")?
        .as_i64()?;
    let content = draft
        .pointer("/payload/content")
        .and_then(Value::as_str)
        .or_else(|| draft.get("text").and_then(Value::as_str))
        .filter(|s| !s.is_empty())?;
    Some(dedupe_key(adapter, locator, idx, content))
}

/// Same derivation for a replayed canonical-log line: the stored key wins,
/// otherwise chat messages get their key recomputed (backfill for log lines
/// written before the field existed).
pub fn dedupe_key_from_event(event: &Value) -> Option<String> {
    if let Some(stored) = event.get("dedupe_key").and_then(Value::as_str) {
        if !stored.is_empty() {
            return Some(stored.to_string());
        }
    }
    let mut without = event.clone();
    if let Some(obj) = without.as_object_mut() {
        obj.remove("dedupe_key");
    }
    dedupe_key_from_draft(&without)
}

// ---------------------------------------------------------------------------
// Zoned timestamps
// ---------------------------------------------------------------------------

/// Current wall clock rendered as zoned ISO-8601 in the workspace timezone.
pub fn iso_now(tz: Tz) -> String {
    Utc::now()
        .with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// A filesystem timestamp (e.g. source-file mtime) rendered in the workspace
/// timezone; used as the `ts` fallback for chat records without one.
pub fn iso_from_system_time(t: SystemTime, tz: Tz) -> String {
    let utc: DateTime<Utc> = t.into();
    utc.with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ulid_shape_and_alphabet() {
        let id = generate_ulid();
        assert!(is_ulid(&id), "bad ulid: {id}");
        assert!(!is_ulid("0123456789ILOU0123456789AB"));
        assert!(!is_ulid("SHORT"));
    }

    #[test]
    fn ulid_timestamp_prefix_is_sortable() {
        let a = ulid_from_parts(1_000, 0);
        let b = ulid_from_parts(2_000, u128::MAX);
        assert!(a < b);
    }

    #[test]
    fn ulid_known_timestamp_encoding() {
        // 1469918176385 ms is the reference vector from the ULID spec.
        let id = ulid_from_parts(1_469_918_176_385, 0);
        assert_eq!(&id[..10], "01ARYZ6S41");
        assert_eq!(&id[10..], "0000000000000000");
    }

    #[test]
    fn canonical_json_sorts_keys_and_keeps_utf8() {
        let v = json!({"b": "你好", "a": 1});
        assert_eq!(canonical_json(&v), r#"{"a":1,"b":"你好"}"#);
    }

    #[test]
    fn event_hash_is_order_independent() {
        let a = json!({"ts": "2026-01-21T10:00:00+09:00", "type": "chat.message", "text": "对账"});
        let b = json!({"text": "对账", "type": "chat.message", "ts": "2026-01-21T10:00:00+09:00"});
        assert_eq!(event_hash_hex(&a), event_hash_hex(&b));
        assert_eq!(event_hash_hex(&a).len(), 64);
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("a \t b\r\nc  "), "a b\nc");
        assert_eq!(normalize_text("one\rtwo"), "one\ntwo");
        assert_eq!(normalize_text("tabs\t\there"), "tabs here");
    }

    #[test]
    fn dedupe_key_is_hex64_and_deterministic() {
        let k1 = dedupe_key("chat_json_file", "/tmp/a.json", 0, "hello  world");
        let k2 = dedupe_key("chat_json_file", "/tmp/a.json", 0, "hello world");
        assert!(is_dedupe_key(&k1));
        // normalization folds the double space, so the keys agree
        assert_eq!(k1, k2);
        let k3 = dedupe_key("chat_json_file", "/tmp/a.json", 1, "hello world");
        assert_ne!(k1, k3);
    }

    #[test]
    fn draft_key_requires_chat_ingredients() {
        let draft = json!({
            "type": "chat.message",
            "source": {"kind": "chat_json_file", "locator": "/tmp/a.json"},
            "refs": [{"kind": "file", "uri": "file:/tmp/a.json", "span": {"idx": 2}}],
            "payload": {"content": "我想做 memobird CLI 打印"},
            "text": "我想做 memobird CLI 打印"
        });
        let key = dedupe_key_from_draft(&draft).expect("chat draft derives a key");
        assert_eq!(
            key,
            dedupe_key("chat_json_file", "/tmp/a.json", 2, "我想做 memobird CLI 打印")
        );

        let missing_idx = json!({
            "type": "chat.message",
            "source": {"kind": "chat_json_file", "locator": "/tmp/a.json"},
            "refs": [{"kind": "file", "uri": "file:/tmp/a.json", "span": {}}],
            "payload": {"content": "x"}
        });
        assert!(dedupe_key_from_draft(&missing_idx).is_none());

        let non_chat = json!({"type": "artifact.created"});
        assert!(dedupe_key_from_draft(&non_chat).is_none());
    }

    #[test]
    fn event_key_prefers_stored_then_backfills() {
        let stored = json!({"type": "chat.message", "dedupe_key": "ab".repeat(32)});
        assert_eq!(dedupe_key_from_event(&stored).unwrap(), "ab".repeat(32));

        let legacy = json!({
            "type": "chat.message",
            "source": {"kind": "chat_json_file", "locator": "/tmp/a.json"},
            "refs": [{"kind": "file", "uri": "file:/tmp/a.json", "span": {"idx": 0}}],
            "payload": {"content": "再做解析"},
            "text": "再做解析"
        });
        let key = dedupe_key_from_event(&legacy).expect("backfilled");
        assert_eq!(key, dedupe_key("chat_json_file", "/tmp/a.json", 0, "再做解析"));
    }

    #[test]
    fn iso_now_carries_zone_offset() {
        let ts = iso_now(chrono_tz::Asia::Tokyo);
        assert!(ts.ends_with("+09:00"), "expected Tokyo offset: {ts}");
    }
}
