//! `index_rebuild`: replay the canonical log into the index. The log is the
//! source of truth; the index can always be wiped and regenerated from it.
//! Chat-message lines without a stored dedupe key get one recomputed, so
//! logs written before the field existed still populate `dedupe`.

use std::path::PathBuf;

use rusqlite::Connection;
use serde_json::Value;
use serde::Serialize;
use tracing::info;

use obr_error::Result;
use obr_ids::{dedupe_key_from_event, iso_now};
use obr_schemas::Event;

use crate::JobContext;

#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    /// Clear events/refs/dedupe before replaying.
    pub wipe: bool,
    /// Reissue the FTS5 'rebuild' command after replay.
    pub fts: bool,
    /// Replay a different log file (defaults to the workspace canonical log).
    pub from: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildCounts {
    pub processed: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub parse_errors: usize,
}

pub fn run(
    conn: &mut Connection,
    ctx: &JobContext<'_>,
    opts: &RebuildOptions,
) -> Result<RebuildCounts> {
    let log_path = opts.from.clone().unwrap_or_else(|| ctx.paths.events.clone());
    let log = obr_canonical::read_log(&log_path)?;

    if opts.wipe {
        obr_db::wipe_event_tables(conn)?;
    }

    let created_at = iso_now(ctx.config.tz()?);
    let mut counts = RebuildCounts {
        parse_errors: log.parse_errors,
        ..RebuildCounts::default()
    };

    for line in &log.lines {
        counts.processed += 1;
        let id = match line.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id,
            _ => {
                counts.parse_errors += 1;
                continue;
            }
        };
        if obr_db::event_exists(conn, id)? {
            counts.skipped += 1;
            continue;
        }
        let dedupe_key = dedupe_key_from_event(line);
        let mut event: Event = match serde_json::from_value(line.clone()) {
            Ok(event) => event,
            Err(_) => {
                counts.parse_errors += 1;
                continue;
            }
        };
        event.dedupe_key = dedupe_key;
        obr_db::insert_event(conn, &event, &created_at)?;
        counts.inserted += 1;
    }

    if opts.fts {
        obr_db::rebuild_fts(conn)?;
    }

    info!(
        processed = counts.processed,
        inserted = counts.inserted,
        skipped = counts.skipped,
        parse_errors = counts.parse_errors,
        from = %log_path.display(),
        "index rebuild finished"
    );
    Ok(counts)
}
