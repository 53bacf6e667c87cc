//! Relational + FTS index over events (`index/brain.sqlite`).
//!
//! The index is a cache: every row here is reconstructible from the
//! canonical log. Schema and triggers are created idempotently on init; the
//! FTS mirror is an external-content FTS5 table bound to `events.rowid` and
//! maintained entirely by triggers, so a search row exists iff its event row
//! does, inside the same transaction.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use obr_error::{OpsError, Result};
use obr_schemas::{
    Event, EventHash, EventRef, EventSource, JobDef, JobRun, SourceDef, ViewDef, SCHEMA_VERSION,
};

pub mod query;

pub use query::{
    event_value, merge_view_query, query_events, query_events_with_fallback, MergedQuery,
    SearchSettings, ViewFilters,
};

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
rowid INTEGER PRIMARY KEY AUTOINCREMENT,
id TEXT NOT NULL UNIQUE,
schema_version TEXT NOT NULL,
ts TEXT NOT NULL,
type TEXT NOT NULL,
tags_json TEXT NOT NULL DEFAULT '[]',
text TEXT NOT NULL DEFAULT '',
payload_json TEXT NOT NULL DEFAULT '{}',
source_kind TEXT NOT NULL,
source_locator TEXT NOT NULL,
source_meta_json TEXT NOT NULL DEFAULT '{}',
hash_algo TEXT NOT NULL,
hash_value TEXT NOT NULL,
dedupe_key TEXT,
created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_ts   ON events(ts);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
CREATE INDEX IF NOT EXISTS idx_events_dedupe ON events(dedupe_key);

CREATE TABLE IF NOT EXISTS refs (
id INTEGER PRIMARY KEY AUTOINCREMENT,
event_id TEXT NOT NULL,
ref_kind TEXT NOT NULL,
uri TEXT NOT NULL,
span_json TEXT NOT NULL DEFAULT '{}',
digest_algo TEXT,
digest_value TEXT,
FOREIGN KEY(event_id) REFERENCES events(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_refs_event ON refs(event_id);
CREATE INDEX IF NOT EXISTS idx_refs_uri   ON refs(uri);

CREATE TABLE IF NOT EXISTS dedupe (
dedupe_key TEXT PRIMARY KEY,
event_id TEXT NOT NULL,
first_seen_ts TEXT NOT NULL,
FOREIGN KEY(event_id) REFERENCES events(id) ON DELETE CASCADE
);

CREATE VIRTUAL TABLE IF NOT EXISTS events_fts
USING fts5(
text,
content='events',
content_rowid='rowid',
tokenize='unicode61 remove_diacritics 2'
);

CREATE TRIGGER IF NOT EXISTS events_ai AFTER INSERT ON events BEGIN
INSERT INTO events_fts(rowid, text) VALUES (new.rowid, new.text);
END;
CREATE TRIGGER IF NOT EXISTS events_ad AFTER DELETE ON events BEGIN
INSERT INTO events_fts(events_fts, rowid, text) VALUES('delete', old.rowid, old.text);
END;
CREATE TRIGGER IF NOT EXISTS events_au AFTER UPDATE OF text ON events BEGIN
INSERT INTO events_fts(events_fts, rowid, text) VALUES('delete', old.rowid, old.text);
INSERT INTO events_fts(rowid, text) VALUES (new.rowid, new.text);
END;

CREATE TABLE IF NOT EXISTS meta (
key TEXT PRIMARY KEY,
value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sources (
name TEXT PRIMARY KEY,
kind TEXT NOT NULL,
config_json TEXT NOT NULL DEFAULT '{}',
tags_json TEXT NOT NULL DEFAULT '[]',
created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sources_kind ON sources(kind);

CREATE TABLE IF NOT EXISTS views (
name TEXT PRIMARY KEY,
description TEXT NOT NULL DEFAULT '',
query_json TEXT NOT NULL,
created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_views_name ON views(name);

CREATE TABLE IF NOT EXISTS jobs (
name TEXT PRIMARY KEY,
kind TEXT NOT NULL,
config_json TEXT NOT NULL DEFAULT '{}',
enabled INTEGER NOT NULL DEFAULT 1,
created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_enabled ON jobs(enabled);

CREATE TABLE IF NOT EXISTS job_runs (
id TEXT PRIMARY KEY,
job_name TEXT NOT NULL,
started_at TEXT NOT NULL,
finished_at TEXT,
status TEXT NOT NULL,
output_json TEXT NOT NULL DEFAULT '{}',
error TEXT,
FOREIGN KEY(job_name) REFERENCES jobs(name) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_job_runs_job_started ON job_runs(job_name, started_at);
"#;

// ---------------------------------------------------------------------------
// Connect / init
// ---------------------------------------------------------------------------

/// Open a connection with the workspace pragmas applied.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| OpsError::Database(format!("SQLite connection error: {e}")))?;
    // journal_mode is the one pragma that answers with a row.
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute_batch(
        "PRAGMA synchronous=NORMAL;\n\
         PRAGMA foreign_keys=ON;\n\
         PRAGMA temp_store=MEMORY;",
    )?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(conn)
}

/// Create all tables/indexes/triggers idempotently and record the schema
/// version if this is a fresh index.
pub fn init_db(db_path: &Path) -> Result<()> {
    let conn = connect(db_path)?;
    conn.execute_batch(DDL)?;
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params!["schema_version"],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_none() {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)",
            params!["schema_version", SCHEMA_VERSION],
        )?;
    }
    debug!(db = %db_path.display(), "index initialized");
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

fn json_string<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| OpsError::Database(format!("JSON encode error: {e}")))
}

/// Insert an event, its refs and (when keyed) its dedupe row in one
/// transaction, so the FTS trigger output commits atomically with the rest.
pub fn insert_event(conn: &mut Connection, event: &Event, created_at: &str) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO events (
            id, schema_version, ts, type, tags_json, text, payload_json,
            source_kind, source_locator, source_meta_json, hash_algo, hash_value,
            dedupe_key, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            event.id,
            event.schema_version,
            event.ts,
            event.r#type,
            json_string(&event.tags)?,
            event.text,
            json_string(&event.payload)?,
            event.source.kind,
            event.source.locator,
            json_string(&event.source.meta)?,
            event.hash.algo,
            event.hash.value,
            event.dedupe_key,
            created_at,
        ],
    )?;
    for r in &event.refs {
        tx.execute(
            "INSERT INTO refs (event_id, ref_kind, uri, span_json, digest_algo, digest_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                r.kind,
                r.uri,
                json_string(&r.span)?,
                r.digest.as_ref().map(|d| d.algo.clone()),
                r.digest.as_ref().map(|d| d.value.clone()),
            ],
        )?;
    }
    if let Some(key) = &event.dedupe_key {
        tx.execute(
            "INSERT OR IGNORE INTO dedupe (dedupe_key, event_id, first_seen_ts) VALUES (?1, ?2, ?3)",
            params![key, event.id, event.ts],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn event_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// Look up the event id holding a dedupe key, if any.
pub fn find_dedupe(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT event_id FROM dedupe WHERE dedupe_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

struct EventRowRaw {
    id: String,
    schema_version: String,
    ts: String,
    event_type: String,
    tags_json: String,
    text: String,
    payload_json: String,
    source_kind: String,
    source_locator: String,
    source_meta_json: String,
    hash_algo: String,
    hash_value: String,
    dedupe_key: Option<String>,
    created_at: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRowRaw> {
    Ok(EventRowRaw {
        id: row.get("id")?,
        schema_version: row.get("schema_version")?,
        ts: row.get("ts")?,
        event_type: row.get("type")?,
        tags_json: row.get("tags_json")?,
        text: row.get("text")?,
        payload_json: row.get("payload_json")?,
        source_kind: row.get("source_kind")?,
        source_locator: row.get("source_locator")?,
        source_meta_json: row.get("source_meta_json")?,
        hash_algo: row.get("hash_algo")?,
        hash_value: row.get("hash_value")?,
        dedupe_key: row.get("dedupe_key")?,
        created_at: row.get("created_at")?,
    })
}

fn parse_json_col(raw: &str, col: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| OpsError::Database(format!("Corrupt {col} column: {e}")))
}

fn raw_to_event(raw: EventRowRaw, refs: Vec<EventRef>) -> Result<Event> {
    let tags: Vec<String> = serde_json::from_str(&raw.tags_json)
        .map_err(|e| OpsError::Database(format!("Corrupt tags_json column: {e}")))?;
    let payload = parse_json_col(&raw.payload_json, "payload_json")?
        .as_object()
        .cloned()
        .unwrap_or_default();
    let meta = parse_json_col(&raw.source_meta_json, "source_meta_json")?
        .as_object()
        .cloned()
        .unwrap_or_default();
    Ok(Event {
        schema_version: raw.schema_version,
        ts: raw.ts,
        r#type: raw.event_type,
        source: EventSource {
            kind: raw.source_kind,
            locator: raw.source_locator,
            meta,
        },
        refs,
        tags,
        text: raw.text,
        payload,
        id: raw.id,
        hash: EventHash {
            algo: raw.hash_algo,
            value: raw.hash_value,
        },
        dedupe_key: raw.dedupe_key,
        created_at: Some(raw.created_at),
    })
}

pub fn fetch_refs(conn: &Connection, event_id: &str) -> Result<Vec<EventRef>> {
    let mut stmt = conn.prepare(
        "SELECT ref_kind, uri, span_json, digest_algo, digest_value
         FROM refs WHERE event_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![event_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;
    let mut refs = Vec::new();
    for row in rows {
        let (kind, uri, span_json, digest_algo, digest_value) = row?;
        let span = parse_json_col(&span_json, "span_json")?
            .as_object()
            .cloned()
            .unwrap_or_default();
        let digest = match (digest_algo, digest_value) {
            (Some(algo), Some(value)) => Some(obr_schemas::RefDigest { algo, value }),
            _ => None,
        };
        refs.push(EventRef {
            kind,
            uri,
            span,
            digest,
        });
    }
    Ok(refs)
}

/// Reconstruct the full event (refs included, `created_at` from the index).
pub fn fetch_event(conn: &Connection, id: &str) -> Result<Option<Event>> {
    let raw = conn
        .query_row("SELECT * FROM events WHERE id = ?1", params![id], row_to_raw)
        .optional()?;
    match raw {
        Some(raw) => {
            let refs = fetch_refs(conn, &raw.id)?;
            Ok(Some(raw_to_event(raw, refs)?))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

pub fn upsert_source(conn: &Connection, source: &SourceDef) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sources (name, kind, config_json, tags_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            source.name,
            source.kind,
            json_string(&source.config)?,
            json_string(&source.tags)?,
            source.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_source(conn: &Connection, name: &str) -> Result<Option<SourceDef>> {
    let row = conn
        .query_row(
            "SELECT name, kind, config_json, tags_json, created_at FROM sources WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    row.map(|(name, kind, config_json, tags_json, created_at)| {
        Ok(SourceDef {
            name,
            kind,
            config: parse_json_col(&config_json, "config_json")?,
            tags: serde_json::from_str(&tags_json)
                .map_err(|e| OpsError::Database(format!("Corrupt tags_json column: {e}")))?,
            created_at,
        })
    })
    .transpose()
}

pub fn list_sources(conn: &Connection) -> Result<Vec<SourceDef>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sources ORDER BY created_at DESC, name ASC")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if let Some(source) = get_source(conn, &name)? {
            out.push(source);
        }
    }
    Ok(out)
}

pub fn delete_source(conn: &Connection, name: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM sources WHERE name = ?1", params![name])?;
    Ok(n > 0)
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

pub fn upsert_view(conn: &Connection, view: &ViewDef) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO views (name, description, query_json, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            view.name,
            view.description,
            json_string(&view.query)?,
            view.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_view(conn: &Connection, name: &str) -> Result<Option<ViewDef>> {
    let row = conn
        .query_row(
            "SELECT name, description, query_json, created_at FROM views WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(name, description, query_json, created_at)| {
        Ok(ViewDef {
            name,
            description,
            query: parse_json_col(&query_json, "query_json")?,
            created_at,
        })
    })
    .transpose()
}

pub fn list_views(conn: &Connection) -> Result<Vec<ViewDef>> {
    let mut stmt = conn.prepare("SELECT name FROM views ORDER BY created_at DESC, name ASC")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if let Some(view) = get_view(conn, &name)? {
            out.push(view);
        }
    }
    Ok(out)
}

pub fn delete_view(conn: &Connection, name: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM views WHERE name = ?1", params![name])?;
    Ok(n > 0)
}

/// Seed the builtin views if absent. Safe to call on every start.
pub fn ensure_builtin_views(conn: &Connection, created_at: &str) -> Result<()> {
    for name in ["timeline", "tag_timeline"] {
        if get_view(conn, name)?.is_some() {
            continue;
        }
        upsert_view(
            conn,
            &ViewDef {
                name: name.to_string(),
                description: String::new(),
                query: serde_json::json!({
                    "kind": "events_query",
                    "filters": {},
                    "order": "desc"
                }),
                created_at: created_at.to_string(),
            },
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs + job runs
// ---------------------------------------------------------------------------

pub fn upsert_job(conn: &Connection, job: &JobDef) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO jobs (name, kind, config_json, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            job.name,
            job.kind,
            json_string(&job.config)?,
            job.enabled as i64,
            job.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_job(conn: &Connection, name: &str) -> Result<Option<JobDef>> {
    let row = conn
        .query_row(
            "SELECT name, kind, config_json, enabled, created_at FROM jobs WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    row.map(|(name, kind, config_json, enabled, created_at)| {
        Ok(JobDef {
            name,
            kind,
            config: parse_json_col(&config_json, "config_json")?,
            enabled: enabled != 0,
            created_at,
        })
    })
    .transpose()
}

pub fn list_jobs(conn: &Connection) -> Result<Vec<JobDef>> {
    let mut stmt = conn.prepare("SELECT name FROM jobs ORDER BY created_at DESC, name ASC")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        if let Some(job) = get_job(conn, &name)? {
            out.push(job);
        }
    }
    Ok(out)
}

pub fn delete_job(conn: &Connection, name: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM jobs WHERE name = ?1", params![name])?;
    Ok(n > 0)
}

pub fn insert_job_run(conn: &Connection, run: &JobRun) -> Result<()> {
    conn.execute(
        "INSERT INTO job_runs (id, job_name, started_at, finished_at, status, output_json, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run.id.to_string(),
            run.job_name,
            run.started_at,
            run.finished_at,
            run.status,
            json_string(&run.output)?,
            run.error,
        ],
    )?;
    Ok(())
}

/// Single completion update: a run is written once as running, finished once.
pub fn finish_job_run(
    conn: &Connection,
    id: &uuid::Uuid,
    finished_at: &str,
    status: &str,
    output: &Value,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE job_runs SET finished_at = ?2, status = ?3, output_json = ?4, error = ?5
         WHERE id = ?1",
        params![id.to_string(), finished_at, status, json_string(output)?, error],
    )?;
    Ok(())
}

pub fn list_job_runs(conn: &Connection, job_name: &str) -> Result<Vec<JobRun>> {
    let mut stmt = conn.prepare(
        "SELECT id, job_name, started_at, finished_at, status, output_json, error
         FROM job_runs WHERE job_name = ?1 ORDER BY started_at DESC",
    )?;
    let rows = stmt.query_map(params![job_name], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, job_name, started_at, finished_at, status, output_json, error) = row?;
        out.push(JobRun {
            id: id
                .parse()
                .map_err(|e| OpsError::Database(format!("Corrupt job_runs.id: {e}")))?,
            job_name,
            started_at,
            finished_at,
            status,
            output: parse_json_col(&output_json, "output_json")?,
            error,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Maintenance (rebuild support)
// ---------------------------------------------------------------------------

/// Drop all event-derived rows. Deleting from `events` fires the FTS delete
/// triggers row by row, keeping the external-content index coherent.
pub fn wipe_event_tables(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM refs", [])?;
    conn.execute("DELETE FROM dedupe", [])?;
    conn.execute("DELETE FROM events", [])?;
    Ok(())
}

/// Resync the external-content FTS index from the events table.
pub fn rebuild_fts(conn: &Connection) -> Result<()> {
    conn.execute("INSERT INTO events_fts(events_fts) VALUES('rebuild')", [])?;
    Ok(())
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    // table names come from our own code, never from request input
    let sql = format!("SELECT COUNT(*) FROM {table}");
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}
