//! In-process scenario tests for the opsd HTTP surface.
//!
//! No TCP: each test builds the Axum router over a temp workspace and
//! drives it via `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use obr_config::OpsConfig;
use obr_daemon::{routes, state::ServerContext};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    dir: tempfile::TempDir,
    ctx: Arc<ServerContext>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = OpsConfig {
            workspace: dir.path().join("data"),
            ..OpsConfig::default()
        };
        let ctx = ServerContext::init(config).unwrap();
        Self { dir, ctx }
    }

    fn router(&self) -> axum::Router {
        routes::build_router(Arc::clone(&self.ctx))
    }

    fn write_chat_file(&self, name: &str, content: &str) -> std::path::PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

async fn call(
    router: axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(value) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&value).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.oneshot(request).await.expect("oneshot failed");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body is not valid JSON")
    };
    (status, value)
}

const CHAT_ARRAY: &str = r#"[
{"ts":"2026-01-21T10:00:00+09:00","speaker":"user","content":"我想做 memobird CLI 打印","thread_id":"t1"},
{"ts":"2026-01-21T10:00:05+09:00","speaker":"assistant","content":"可以，先抓包再分析协议","thread_id":"t1"},
{"ts":"2026-01-21T10:00:10+09:00","speaker":"user","content":"对账也想自动化，导出支付宝微信","thread_id":"t1"}
]
"#;

fn chat_draft(locator: &str, idx: i64, content: &str) -> Value {
    json!({
        "schema_version": "0.2",
        "ts": format!("2026-01-21T10:00:{:02}+09:00", idx * 5),
        "type": "chat.message",
        "source": {"kind": "chat_json_file", "locator": locator, "meta": {}},
        "refs": [{"kind": "file", "uri": format!("file:{locator}"), "span": {"idx": idx}}],
        "tags": ["demo"],
        "text": content,
        "payload": {"speaker": "user", "content": content, "thread_id": "t1"}
    })
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_schema_version() {
    let h = Harness::new();
    let (status, body) = call(h.router(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["schema_version"], "0.2");
    assert!(body["version"].is_string());
}

// ---------------------------------------------------------------------------
// POST /v1/events:batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_inserts_then_skips_duplicates() {
    let h = Harness::new();
    let drafts = vec![
        chat_draft("/tmp/chat.json", 0, "我想做 memobird CLI 打印"),
        chat_draft("/tmp/chat.json", 1, "可以，先抓包再分析协议"),
        chat_draft("/tmp/chat.json", 2, "对账也想自动化"),
    ];
    let payload = json!({"events": drafts, "options": {"dedupe": true}});

    let (status, first) = call(h.router(), "POST", "/v1/events:batch", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["inserted"], 3);
    assert_eq!(first["new"], 3);
    assert_eq!(first["skipped"], 0);
    assert_eq!(first["failed"], 0);
    assert_eq!(first["ids"].as_array().unwrap().len(), 3);

    let (_, second) = call(h.router(), "POST", "/v1/events:batch", Some(payload)).await;
    assert_eq!(second["inserted"], 0);
    assert_eq!(second["skipped"], 3);
    for item in second["results"].as_array().unwrap() {
        assert_eq!(item["status"], "skipped");
        assert!(item["existing_event_id"].is_string());
    }

    assert_eq!(
        obr_canonical::count_events(&h.ctx.paths.events).unwrap(),
        3
    );
}

#[tokio::test]
async fn batch_rejects_non_list_events() {
    let h = Harness::new();
    let (status, body) = call(
        h.router(),
        "POST",
        "/v1/events:batch",
        Some(json!({"events": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "events must be a list");
}

// ---------------------------------------------------------------------------
// GET /v1/events, /v1/events/{id}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn events_query_filters_and_shows_full_event() {
    let h = Harness::new();
    let drafts = vec![
        chat_draft("/tmp/chat.json", 0, "我想做 memobird CLI 打印"),
        chat_draft("/tmp/chat.json", 1, "可以，先抓包再分析协议"),
    ];
    call(
        h.router(),
        "POST",
        "/v1/events:batch",
        Some(json!({"events": drafts})),
    )
    .await;

    let (status, body) = call(
        h.router(),
        "GET",
        "/v1/events?q=memobird&type=chat.message,artifact.created&tag=demo",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0]["snippet"].as_str().unwrap().contains("memobird"));

    let id = items[0]["id"].as_str().unwrap();
    let (status, event) = call(h.router(), "GET", &format!("/v1/events/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(event["payload"]["content"], "我想做 memobird CLI 打印");
    assert_eq!(event["hash"]["algo"], "sha256");

    let (status, body) = call(h.router(), "GET", "/v1/events/0000000000000000000000MISS", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not found");
}

// ---------------------------------------------------------------------------
// Sources + ingest
// ---------------------------------------------------------------------------

#[tokio::test]
async fn source_crud_test_and_ingest_run() {
    let h = Harness::new();
    let chat_path = h.write_chat_file("chat_export.json", CHAT_ARRAY);

    let (status, created) = call(
        h.router(),
        "POST",
        "/v1/sources",
        Some(json!({
            "name": "chat_export",
            "kind": "chat_json_file",
            "config": {"path": chat_path.to_string_lossy(), "copy": true},
            "tags": ["memobird"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["name"], "chat_export");

    let (_, listed) = call(h.router(), "GET", "/v1/sources", None).await;
    assert_eq!(listed["items"].as_array().unwrap().len(), 1);

    let (status, test) = call(h.router(), "POST", "/v1/sources/chat_export:test", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(test["ok"], true);
    assert_eq!(test["messages"], 3);

    // dry run first: counts but no writes
    let (_, dry) = call(
        h.router(),
        "POST",
        "/v1/ingests/chat_export:run",
        Some(json!({"tags": ["t2"], "dry_run": true})),
    )
    .await;
    assert_eq!(dry["new"], 3);
    assert_eq!(obr_canonical::count_events(&h.ctx.paths.events).unwrap(), 0);

    let (status, ran) = call(
        h.router(),
        "POST",
        "/v1/ingests/chat_export:run",
        Some(json!({"tags": ["t2"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ran["new"], 3);
    assert_eq!(ran["skipped"], 0);

    // the copy landed in raw/chat_json with a digest-prefixed name
    let raw_entries: Vec<_> = std::fs::read_dir(&h.ctx.paths.raw).unwrap().collect();
    assert_eq!(raw_entries.len(), 1);

    // stored source tags merged with request tags
    let (_, events) = call(h.router(), "GET", "/v1/events?tag=memobird", None).await;
    let items = events["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    let tags = items[0]["tags"].as_array().unwrap();
    assert!(tags.contains(&json!("memobird")) && tags.contains(&json!("t2")));

    let (status, _) = call(h.router(), "DELETE", "/v1/sources/chat_export", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(h.router(), "GET", "/v1/sources/chat_export", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn source_test_reports_failure_with_ok_false() {
    let h = Harness::new();
    call(
        h.router(),
        "POST",
        "/v1/sources",
        Some(json!({
            "name": "missing",
            "config": {"path": "/nonexistent/chat.json"},
        })),
    )
    .await;
    let (status, test) = call(h.router(), "POST", "/v1/sources/missing:test", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(test["ok"], false);
    assert!(test["error"].is_string());
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn builtin_views_exist_and_view_query_merges_filters() {
    let h = Harness::new();
    let (_, views) = call(h.router(), "GET", "/v1/views", None).await;
    let names: Vec<&str> = views["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"timeline"));
    assert!(names.contains(&"tag_timeline"));

    let drafts = vec![
        chat_draft("/tmp/chat.json", 0, "memobird one"),
        chat_draft("/tmp/chat.json", 1, "other two"),
    ];
    call(
        h.router(),
        "POST",
        "/v1/events:batch",
        Some(json!({"events": drafts})),
    )
    .await;

    // stored tag filter narrows; request adds the time window
    call(
        h.router(),
        "POST",
        "/v1/views",
        Some(json!({
            "name": "demo_view",
            "description": "demo only",
            "query": {"kind": "events_query", "filters": {"tag": ["demo"]}, "order": "asc"},
        })),
    )
    .await;
    let (status, result) = call(
        h.router(),
        "POST",
        "/v1/views/demo_view:query",
        Some(json!({
            "filters": {"after": "2026-01-21T10:00:03+09:00"},
            "limit": 10,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = result["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0]["snippet"].as_str().unwrap().contains("other"));
}

// ---------------------------------------------------------------------------
// Jobs + artifacts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_run_produces_digest_and_pack_lists_artifacts() {
    let h = Harness::new();
    let chat_path = h.write_chat_file("chat_export.json", CHAT_ARRAY);
    call(
        h.router(),
        "POST",
        "/v1/sources",
        Some(json!({
            "name": "chat_export",
            "config": {"path": chat_path.to_string_lossy(), "copy": false},
            "tags": ["memobird"],
        })),
    )
    .await;
    let (_, ingest) = call(
        h.router(),
        "POST",
        "/v1/ingests/chat_export:run",
        Some(json!({})),
    )
    .await;
    assert_eq!(ingest["new"], 3);

    let (_, job) = call(
        h.router(),
        "POST",
        "/v1/jobs",
        Some(json!({
            "name": "daily",
            "kind": "daily_digest",
            "config": {
                "view": "timeline",
                "day": "2026-01-21",
                "out_dir": "artifacts/runs/2026-01-21",
                "tags": ["memobird"],
            },
        })),
    )
    .await;
    assert_eq!(job["enabled"], true);

    let (status, run) = call(h.router(), "POST", "/v1/jobs/daily:run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "ok");
    assert_eq!(run["output"]["events"], 3);

    let digest_path = h
        .ctx
        .paths
        .workspace
        .join("artifacts/runs/2026-01-21/daily_digest.md");
    assert!(digest_path.is_file());

    let (_, runs) = call(h.router(), "GET", "/v1/jobs/daily/runs", None).await;
    assert_eq!(runs["items"].as_array().unwrap().len(), 1);
    assert_eq!(runs["items"][0]["status"], "ok");

    // pack the tag; a new artifact event must reference both outputs
    let (status, pack) = call(
        h.router(),
        "POST",
        "/v1/artifacts:pack",
        Some(json!({"tag": "memobird", "out_dir": "artifacts/packs/memobird"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(pack["pack_path"].as_str().unwrap().ends_with("pack.json"));
    assert!(pack["readme_path"].as_str().unwrap().ends_with("README.md"));
    assert_eq!(pack["assets"].as_array().unwrap().len(), 1);

    let (_, artifacts) = call(h.router(), "GET", "/v1/artifacts?tag=memobird", None).await;
    let items = artifacts["items"].as_array().unwrap();
    // digest artifact + pack artifact both carry the tag
    assert_eq!(items.len(), 2);
    for item in items {
        assert!(item["files"].as_array().is_some());
    }
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_route_is_json_404() {
    let h = Harness::new();
    let (status, body) = call(h.router(), "GET", "/v1/does_not_exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Not found");
}

#[tokio::test]
async fn second_daemon_on_same_workspace_is_refused() {
    let h = Harness::new();
    let config = OpsConfig {
        workspace: h.ctx.paths.workspace.clone(),
        ..OpsConfig::default()
    };
    let err = ServerContext::init(config).unwrap_err();
    assert_eq!(err.exit_code(), 40);

    let lock_text = std::fs::read_to_string(&h.ctx.paths.daemon_lock).unwrap();
    assert!(lock_text.starts_with("pid="));
}
