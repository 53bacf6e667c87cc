//! Daily-digest job scenario: ingest a day of chat, run the job against the
//! builtin timeline view, check the markdown artifact and the emitted
//! `artifact.created` event.

use serde_json::json;

use obr_adapters::CHAT_JSON_KIND;
use obr_config::{OpsConfig, WorkspacePaths};
use obr_jobs::{JobContext, KIND_DAILY_DIGEST};
use obr_schemas::JobDef;

const CHAT_ARRAY: &str = r#"[
{"ts":"2026-01-21T10:00:00+09:00","speaker":"user","content":"我想做 memobird CLI 打印","thread_id":"t1"},
{"ts":"2026-01-21T10:00:05+09:00","speaker":"assistant","content":"可以，先抓包再分析协议","thread_id":"t1"},
{"ts":"2026-01-21T10:00:10+09:00","speaker":"user","content":"对账也想自动化，导出支付宝微信","thread_id":"t1"}
]
"#;

struct Workspace {
    _dir: tempfile::TempDir,
    config: OpsConfig,
    paths: WorkspacePaths,
}

fn workspace_with_chat() -> Workspace {
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
    let drafts = obr_adapters::build_chat_drafts(
        &src,
        CHAT_JSON_KIND,
        &["memobird".to_string()],
        &config,
        false,
    )
    .unwrap();
    let mut conn = obr_db::connect(&paths.db).unwrap();
    obr_db::ensure_builtin_views(&conn, "2026-01-21T09:00:00+09:00").unwrap();
    let response = obr_pipeline::ingest_batch(
        &mut conn,
        &paths,
        config.tz().unwrap(),
        &obr_pipeline::drafts_to_values(&drafts),
        &obr_pipeline::IngestOptions::default(),
    );
    assert_eq!(response.new, 3);

    Workspace {
        _dir: dir,
        config,
        paths,
    }
}

#[test]
fn digest_writes_markdown_and_emits_artifact_event() {
    let ws = workspace_with_chat();
    let mut conn = obr_db::connect(&ws.paths.db).unwrap();
    let ctx = JobContext {
        config: &ws.config,
        paths: &ws.paths,
    };
    let job = JobDef {
        name: "daily".to_string(),
        kind: KIND_DAILY_DIGEST.to_string(),
        config: json!({
            "view": "timeline",
            "day": "2026-01-21",
            "out_dir": "artifacts/runs/2026-01-21",
            "tags": ["memobird"],
        }),
        enabled: true,
        created_at: String::new(),
    };
    obr_db::upsert_job(&conn, &job).unwrap();

    let run = obr_jobs::run_job(&mut conn, &ctx, &job).unwrap();
    assert_eq!(run.status, "ok", "error: {:?}", run.error);
    assert!(run.finished_at.is_some());
    assert_eq!(run.output["events"], 3);

    let digest_path = ws
        .paths
        .workspace
        .join("artifacts/runs/2026-01-21/daily_digest.md");
    let md = std::fs::read_to_string(&digest_path).unwrap();
    assert!(md.starts_with("# Daily Digest 2026-01-21"));
    assert!(md.contains("- chat.message: 3"));
    assert!(md.contains("- memobird: 3"));
    assert!(md.contains("memobird CLI"));

    // the artifact event points at the digest file and carries the tags
    let artifact_id = run.output["artifact_event_id"].as_str().unwrap();
    let event = obr_db::fetch_event(&conn, artifact_id).unwrap().unwrap();
    assert_eq!(event.r#type, "artifact.created");
    assert_eq!(event.tags, vec!["digest".to_string(), "memobird".to_string()]);
    assert_eq!(
        event.refs[0].uri,
        format!("file:{}", digest_path.display())
    );
    assert!(event.dedupe_key.is_none());

    // run row is persisted with the same outcome
    let runs = obr_db::list_job_runs(&conn, "daily").unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "ok");
}

#[test]
fn digest_for_an_empty_day_still_succeeds() {
    let ws = workspace_with_chat();
    let mut conn = obr_db::connect(&ws.paths.db).unwrap();
    let ctx = JobContext {
        config: &ws.config,
        paths: &ws.paths,
    };
    let job = JobDef {
        name: "empty-day".to_string(),
        kind: KIND_DAILY_DIGEST.to_string(),
        config: json!({"view": "timeline", "day": "2025-06-01", "out_dir": "artifacts/empty"}),
        enabled: true,
        created_at: String::new(),
    };
    obr_db::upsert_job(&conn, &job).unwrap();

    let run = obr_jobs::run_job(&mut conn, &ctx, &job).unwrap();
    assert_eq!(run.status, "ok");
    assert_eq!(run.output["events"], 0);
    let md = std::fs::read_to_string(ws.paths.workspace.join("artifacts/empty/daily_digest.md"))
        .unwrap();
    assert!(md.contains("Total events: 0"));
}

#[test]
fn missing_view_fails_the_run_not_the_engine() {
    let ws = workspace_with_chat();
    let mut conn = obr_db::connect(&ws.paths.db).unwrap();
    let ctx = JobContext {
        config: &ws.config,
        paths: &ws.paths,
    };
    let job = JobDef {
        name: "broken".to_string(),
        kind: KIND_DAILY_DIGEST.to_string(),
        config: json!({"view": "nope", "day": "2026-01-21", "out_dir": "artifacts/broken"}),
        enabled: true,
        created_at: String::new(),
    };
    obr_db::upsert_job(&conn, &job).unwrap();

    let run = obr_jobs::run_job(&mut conn, &ctx, &job).unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error.as_deref(), Some("View not found: nope"));

    let runs = obr_db::list_job_runs(&conn, "broken").unwrap();
    assert_eq!(runs[0].status, "failed");
}
