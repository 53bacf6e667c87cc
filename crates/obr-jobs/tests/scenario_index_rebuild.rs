//! Rebuild scenarios: wipe + replay restores the index from the canonical
//! log, replay is incremental when rows already exist, and chat lines whose
//! dedupe_key was stripped get it backfilled.

use serde_json::{json, Value};

use obr_adapters::CHAT_JSON_KIND;
use obr_config::{OpsConfig, WorkspacePaths};
use obr_jobs::{JobContext, RebuildOptions};

const CHAT_ARRAY: &str = r#"[
{"ts":"2026-02-01T10:00:00+09:00","speaker":"user","content":"我们来做对账机器人","thread_id":"t3"},
{"ts":"2026-02-01T10:00:05+09:00","speaker":"assistant","content":"先整理接口，再做解析","thread_id":"t3"},
{"ts":"2026-02-01T10:00:10+09:00","speaker":"user","content":"还需要日报导出","thread_id":"t3"}
]
"#;

fn ingested_workspace() -> (tempfile::TempDir, OpsConfig, WorkspacePaths) {
    let dir = tempfile::tempdir().unwrap();
    let config = OpsConfig {
        workspace: dir.path().join("data"),
        ..OpsConfig::default()
    };
    let paths = WorkspacePaths::resolve(&config);
    paths.ensure().unwrap();
    obr_db::init_db(&paths.db).unwrap();

    let src = dir.path().join("small.json");
    std::fs::write(&src, CHAT_ARRAY).unwrap();
    let drafts =
        obr_adapters::build_chat_drafts(&src, CHAT_JSON_KIND, &[], &config, false).unwrap();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    let response = obr_pipeline::ingest_batch(
        &mut conn,
        &paths,
        config.tz().unwrap(),
        &obr_pipeline::drafts_to_values(&drafts),
        &obr_pipeline::IngestOptions::default(),
    );
    assert_eq!(response.new, 3);
    (dir, config, paths)
}

#[test]
fn wipe_and_replay_restores_counts() {
    let (_dir, config, paths) = ingested_workspace();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    let ctx = JobContext {
        config: &config,
        paths: &paths,
    };

    let counts = obr_jobs::rebuild::run(
        &mut conn,
        &ctx,
        &RebuildOptions {
            wipe: true,
            fts: true,
            from: None,
        },
    )
    .unwrap();
    assert_eq!(counts.processed, 3);
    assert_eq!(counts.inserted, 3);
    assert_eq!(counts.skipped, 0);
    assert_eq!(counts.parse_errors, 0);

    assert_eq!(obr_db::count_rows(&conn, "events").unwrap(), 3);
    assert_eq!(obr_db::count_rows(&conn, "refs").unwrap(), 3);
    assert_eq!(obr_db::count_rows(&conn, "dedupe").unwrap(), 3);

    // ingesting the same file again is still a full skip after rebuild
    let src = paths.workspace.parent().unwrap().join("small.json");
    let drafts =
        obr_adapters::build_chat_drafts(&src, CHAT_JSON_KIND, &[], &config, false).unwrap();
    let response = obr_pipeline::ingest_batch(
        &mut conn,
        &paths,
        config.tz().unwrap(),
        &obr_pipeline::drafts_to_values(&drafts),
        &obr_pipeline::IngestOptions::default(),
    );
    assert_eq!((response.new, response.skipped), (0, 3));
}

#[test]
fn replay_without_wipe_skips_existing_rows() {
    let (_dir, config, paths) = ingested_workspace();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    let ctx = JobContext {
        config: &config,
        paths: &paths,
    };

    let counts = obr_jobs::rebuild::run(&mut conn, &ctx, &RebuildOptions::default()).unwrap();
    assert_eq!(counts.processed, 3);
    assert_eq!(counts.inserted, 0);
    assert_eq!(counts.skipped, 3);
    assert_eq!(obr_db::count_rows(&conn, "events").unwrap(), 3);
}

#[test]
fn rebuild_backfills_stripped_dedupe_keys() {
    let (dir, config, paths) = ingested_workspace();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    let ctx = JobContext {
        config: &config,
        paths: &paths,
    };

    // strip dedupe_key from every log line, as an older-schema log would be
    let log = obr_canonical::read_log(&paths.events).unwrap();
    let legacy_lines: Vec<String> = log
        .lines
        .iter()
        .map(|line| {
            let mut line = line.clone();
            line.as_object_mut().unwrap().remove("dedupe_key");
            serde_json::to_string(&line).unwrap()
        })
        .collect();
    let legacy_path = dir.path().join("events_no_dedupe.jsonl");
    std::fs::write(&legacy_path, format!("{}\n", legacy_lines.join("\n"))).unwrap();

    let counts = obr_jobs::rebuild::run(
        &mut conn,
        &ctx,
        &RebuildOptions {
            wipe: true,
            fts: false,
            from: Some(legacy_path),
        },
    )
    .unwrap();
    assert_eq!(counts.inserted, 3);
    assert_eq!(counts.parse_errors, 0);

    assert_eq!(obr_db::count_rows(&conn, "events").unwrap(), 3);
    assert_eq!(obr_db::count_rows(&conn, "dedupe").unwrap(), 3);

    // backfilled keys equal the original derivation
    for line in &log.lines {
        let key = line["dedupe_key"].as_str().unwrap();
        assert!(obr_db::find_dedupe(&conn, key).unwrap().is_some());
    }
}

#[test]
fn garbage_lines_are_counted_not_fatal() {
    let (dir, config, paths) = ingested_workspace();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    let ctx = JobContext {
        config: &config,
        paths: &paths,
    };

    let log = std::fs::read_to_string(&paths.events).unwrap();
    let mangled = format!("{log}not json\n{{\"no\":\"id\"}}\n");
    let mangled_path = dir.path().join("mangled.jsonl");
    std::fs::write(&mangled_path, mangled).unwrap();

    let counts = obr_jobs::rebuild::run(
        &mut conn,
        &ctx,
        &RebuildOptions {
            wipe: true,
            fts: false,
            from: Some(mangled_path),
        },
    )
    .unwrap();
    assert_eq!(counts.inserted, 3);
    assert_eq!(counts.parse_errors, 2);
}

#[test]
fn job_kind_dispatch_reports_counts_in_output() {
    let (_dir, config, paths) = ingested_workspace();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    let ctx = JobContext {
        config: &config,
        paths: &paths,
    };
    let job = obr_schemas::JobDef {
        name: "reindex".to_string(),
        kind: obr_jobs::KIND_INDEX_REBUILD.to_string(),
        config: json!({"wipe": true, "fts": true}),
        enabled: true,
        created_at: String::new(),
    };
    obr_db::upsert_job(&conn, &job).unwrap();
    let run = obr_jobs::run_job(&mut conn, &ctx, &job).unwrap();
    assert_eq!(run.status, "ok");
    assert_eq!(run.output["processed"], json!(3));
    assert_eq!(run.output["inserted"], json!(3));
}

#[test]
fn unknown_job_kind_fails_the_run() {
    let (_dir, config, paths) = ingested_workspace();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    let ctx = JobContext {
        config: &config,
        paths: &paths,
    };
    let job = obr_schemas::JobDef {
        name: "mystery".to_string(),
        kind: "fold_proteins".to_string(),
        config: Value::Null,
        enabled: true,
        created_at: String::new(),
    };
    obr_db::upsert_job(&conn, &job).unwrap();
    let run = obr_jobs::run_job(&mut conn, &ctx, &job).unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error.as_deref(), Some("Unknown job kind: fold_proteins"));
}
