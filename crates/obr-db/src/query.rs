//! Query engine over indexed events: type/tag/time filters, FTS (or LIKE)
//! text search, summary/full projection and saved-view merging.
//!
//! Time filters compare zoned ISO strings lexicographically; callers are
//! expected to store and query with a consistent UTC offset.

use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};

use obr_error::{OpsError, Result};
use obr_schemas::{Event, QueryFormat, QueryOrder, QueryParams};

use crate::{fetch_refs, raw_to_event, row_to_raw};

/// Index knobs the engine needs (mirrors `index.*` in ops.yml).
#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    pub fts: bool,
    pub max_snippet_len: u32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            fts: true,
            max_snippet_len: 160,
        }
    }
}

// ---------------------------------------------------------------------------
// Query execution
// ---------------------------------------------------------------------------

/// Run a filtered query and project rows per `params.format`.
pub fn query_events(
    conn: &Connection,
    settings: &SearchSettings,
    params: &QueryParams,
) -> Result<Vec<Value>> {
    let use_fts = settings.fts && params.q.is_some();

    let mut sql = String::from("SELECT e.* FROM events e");
    if use_fts {
        sql.push_str(" JOIN events_fts ON events_fts.rowid = e.rowid");
    }

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<String> = Vec::new();

    if let Some(q) = &params.q {
        if use_fts {
            clauses.push("events_fts MATCH ?".to_string());
            binds.push(q.clone());
        } else {
            clauses.push("e.text LIKE ?".to_string());
            binds.push(format!("%{q}%"));
        }
    }
    if let Some(types) = &params.types {
        if !types.is_empty() {
            let marks = vec!["?"; types.len()].join(", ");
            clauses.push(format!("e.type IN ({marks})"));
            binds.extend(types.iter().cloned());
        }
    }
    if let Some(tags) = &params.tags {
        if !tags.is_empty() {
            // tags_json is a JSON array; matching the quoted token is a
            // conservative containment check.
            let ors = vec!["e.tags_json LIKE ?"; tags.len()].join(" OR ");
            clauses.push(format!("({ors})"));
            binds.extend(tags.iter().map(|t| format!("%\"{t}\"%")));
        }
    }
    if let Some(after) = &params.after {
        clauses.push("e.ts >= ?".to_string());
        binds.push(after.clone());
    }
    if let Some(before) = &params.before {
        clauses.push("e.ts <= ?".to_string());
        binds.push(before.clone());
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    let limit = params.limit.max(1);
    sql.push_str(&format!(" ORDER BY e.ts {} LIMIT {limit}", params.order.sql()));

    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(params_from_iter(binds.iter()), row_to_raw)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut items = Vec::with_capacity(raws.len());
    for raw in raws {
        let refs = fetch_refs(conn, &raw.id)?;
        let event = raw_to_event(raw, refs)?;
        items.push(match params.format {
            QueryFormat::Summary => summary_row(&event, settings.max_snippet_len),
            QueryFormat::Full => event_value(&event)?,
        });
    }
    Ok(items)
}

/// Offline-CLI search: FTS first, then LIKE when FTS finds nothing (or the
/// query string is not valid FTS syntax). Best-effort by design.
pub fn query_events_with_fallback(
    conn: &Connection,
    settings: &SearchSettings,
    params: &QueryParams,
) -> Result<Vec<Value>> {
    if settings.fts && params.q.is_some() {
        match query_events(conn, settings, params) {
            Ok(items) if !items.is_empty() => return Ok(items),
            Ok(_) | Err(OpsError::Database(_)) => {}
            Err(err) => return Err(err),
        }
        let like_settings = SearchSettings {
            fts: false,
            ..*settings
        };
        return query_events(conn, &like_settings, params);
    }
    query_events(conn, settings, params)
}

fn summary_row(event: &Event, max_snippet_len: u32) -> Value {
    let snippet: String = event.text.chars().take(max_snippet_len as usize).collect();
    json!({
        "id": event.id,
        "ts": event.ts,
        "type": event.r#type,
        "tags": event.tags,
        "snippet": snippet,
        "refs": event.refs,
    })
}

pub fn event_value(event: &Event) -> Result<Value> {
    serde_json::to_value(event).map_err(|e| OpsError::Database(format!("JSON encode error: {e}")))
}

// ---------------------------------------------------------------------------
// Saved views
// ---------------------------------------------------------------------------

/// The filter subset a view may store (`{filters: {type?, tag?, after?,
/// before?}, order?}`); also the shape of request-side overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewFilters {
    pub types: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub after: Option<String>,
    pub before: Option<String>,
}

impl ViewFilters {
    /// Parse `{type?, tag?, after?, before?}` accepting either a string or a
    /// list for type/tag.
    pub fn from_value(v: &Value) -> Self {
        Self {
            types: string_or_list(v.get("type")),
            tags: string_or_list(v.get("tag")),
            after: v.get("after").and_then(Value::as_str).map(str::to_string),
            before: v.get("before").and_then(Value::as_str).map(str::to_string),
        }
    }
}

fn string_or_list(v: Option<&Value>) -> Option<Vec<String>> {
    match v? {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct MergedQuery {
    pub filters: ViewFilters,
    pub order: QueryOrder,
}

/// Merge a stored view query with request-side filters:
/// type = intersection when both set, tag = ordered union, after = max,
/// before = min, order = request wins.
pub fn merge_view_query(
    stored_query: &Value,
    request: &ViewFilters,
    request_order: Option<QueryOrder>,
) -> MergedQuery {
    let stored = ViewFilters::from_value(
        stored_query.get("filters").unwrap_or(&Value::Null),
    );
    let stored_order = stored_query
        .get("order")
        .and_then(Value::as_str)
        .and_then(|s| match s {
            "asc" => Some(QueryOrder::Asc),
            "desc" => Some(QueryOrder::Desc),
            _ => None,
        });

    let types = match (&stored.types, &request.types) {
        (Some(a), Some(b)) => Some(a.iter().filter(|t| b.contains(t)).cloned().collect()),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    };
    let tags = match (&stored.tags, &request.tags) {
        (Some(a), Some(b)) => {
            let mut merged: Vec<String> = Vec::new();
            for tag in a.iter().chain(b.iter()) {
                if !merged.contains(tag) {
                    merged.push(tag.clone());
                }
            }
            Some(merged)
        }
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    };
    let after = match (&stored.after, &request.after) {
        (Some(a), Some(b)) => Some(a.max(b).clone()),
        (a, b) => a.clone().or_else(|| b.clone()),
    };
    let before = match (&stored.before, &request.before) {
        (Some(a), Some(b)) => Some(a.min(b).clone()),
        (a, b) => a.clone().or_else(|| b.clone()),
    };

    MergedQuery {
        filters: ViewFilters {
            types,
            tags,
            after,
            before,
        },
        order: request_order.or(stored_order).unwrap_or(QueryOrder::Desc),
    }
}

impl MergedQuery {
    /// Turn the merged filters into engine params.
    pub fn into_params(self, limit: i64, format: QueryFormat) -> QueryParams {
        QueryParams {
            q: None,
            types: self.filters.types,
            tags: self.filters.tags,
            after: self.filters.after,
            before: self.filters.before,
            limit,
            format,
            order: self.order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(filters: Value, order: Option<&str>) -> Value {
        let mut q = json!({"kind": "events_query", "filters": filters});
        if let Some(o) = order {
            q["order"] = json!(o);
        }
        q
    }

    #[test]
    fn merge_intersects_types_and_unions_tags() {
        let stored_q = stored(
            json!({"type": ["chat.message", "artifact.created"], "tag": ["a", "b"]}),
            Some("asc"),
        );
        let req = ViewFilters {
            types: Some(vec!["artifact.created".into(), "note".into()]),
            tags: Some(vec!["b".into(), "c".into()]),
            ..Default::default()
        };
        let merged = merge_view_query(&stored_q, &req, None);
        assert_eq!(merged.filters.types, Some(vec!["artifact.created".to_string()]));
        assert_eq!(
            merged.filters.tags,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(merged.order, QueryOrder::Asc);
    }

    #[test]
    fn merge_narrows_time_window() {
        let stored_q = stored(
            json!({"after": "2026-01-01T00:00:00+09:00", "before": "2026-12-31T00:00:00+09:00"}),
            None,
        );
        let req = ViewFilters {
            after: Some("2026-01-21T00:00:00+09:00".into()),
            before: Some("2026-01-22T00:00:00+09:00".into()),
            ..Default::default()
        };
        let merged = merge_view_query(&stored_q, &req, None);
        assert_eq!(merged.filters.after.as_deref(), Some("2026-01-21T00:00:00+09:00"));
        assert_eq!(merged.filters.before.as_deref(), Some("2026-01-22T00:00:00+09:00"));
        assert_eq!(merged.order, QueryOrder::Desc);
    }

    #[test]
    fn merge_takes_whichever_side_is_set() {
        let stored_q = stored(json!({"type": "chat.message"}), None);
        let merged = merge_view_query(&stored_q, &ViewFilters::default(), None);
        assert_eq!(merged.filters.types, Some(vec!["chat.message".to_string()]));
        assert_eq!(merged.filters.tags, None);

        let req = ViewFilters {
            tags: Some(vec!["memobird".into()]),
            ..Default::default()
        };
        let merged = merge_view_query(&stored(json!({}), None), &req, None);
        assert_eq!(merged.filters.tags, Some(vec!["memobird".to_string()]));
    }

    #[test]
    fn request_order_wins_over_stored() {
        let stored_q = stored(json!({}), Some("asc"));
        let merged = merge_view_query(&stored_q, &ViewFilters::default(), Some(QueryOrder::Desc));
        assert_eq!(merged.order, QueryOrder::Desc);
    }
}
