//! Command dispatch. Each data command probes the daemon first; offline
//! fallbacks open the index directly. Returns the process exit code.

use std::path::PathBuf;

use serde_json::{json, Value};

use obr_config::WorkspacePaths;
use obr_error::{OpsError, Result};
use obr_schemas::{QueryFormat, QueryOrder, QueryParams};

use crate::client::OpsdClient;
use crate::local::{self, LocalCtx};
use crate::{ArtifactCmd, Cli, Commands, EventCmd, IndexCmd, IngestCmd, JobCmd, SourceCmd, ViewCmd};

/// Global flags shared by every subcommand.
pub struct Flags {
    pub json: bool,
    pub offline: bool,
}

pub async fn run(cli: Cli) -> Result<i32> {
    let client = OpsdClient::new(&cli.endpoint);
    let flags = Flags {
        json: cli.json,
        offline: cli.offline,
    };
    match cli.cmd {
        Commands::Init => cmd_init(),
        Commands::Serve { host, port } => {
            obr_daemon::serve(&host, port)
                .await
                .map_err(|e| OpsError::Other(e.to_string()))?;
            Ok(0)
        }
        Commands::Source { cmd } => source(cmd, &client, &flags).await,
        Commands::Ingest { cmd } => ingest(cmd, &client, &flags).await,
        Commands::View { cmd } => view(cmd, &client, &flags).await,
        Commands::Job { cmd } => job(cmd, &client, &flags).await,
        Commands::Artifact { cmd } => artifact(cmd, &client, &flags).await,
        Commands::Search {
            query,
            types,
            tags,
            after,
            before,
            limit,
            format,
        } => cmd_search(&client, &flags, query, types, tags, after, before, limit, format).await,
        Commands::Query {
            query,
            types,
            tags,
            after,
            before,
            limit,
            format,
        } => cmd_query(&flags, query, types, tags, after, before, limit, format),
        Commands::Event { cmd } => match cmd {
            EventCmd::Show { event_id } => cmd_event_show(&client, &flags, &event_id).await,
        },
        Commands::Show { event_id } => {
            let ctx = LocalCtx::load()?;
            print_value(&local::show_event(&ctx, &event_id)?, flags.json);
            Ok(0)
        }
        Commands::Index { cmd } => match cmd {
            IndexCmd::Rebuild { wipe, fts, from } => cmd_rebuild(&flags, wipe, fts, from),
        },
    }
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_value(value: &Value, json: bool) {
    if json {
        println!("{value}");
    } else {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }
}

/// `{items: [...]}` responses: `--json` prints the whole response, otherwise
/// the items render pretty.
fn print_items(response: &Value, json: bool) {
    if json {
        println!("{response}");
    } else {
        let items = response.get("items").cloned().unwrap_or(Value::Array(vec![]));
        println!("{}", serde_json::to_string_pretty(&items).unwrap_or_default());
    }
}

async fn require_online(client: &OpsdClient) -> Result<()> {
    if client.is_online().await {
        Ok(())
    } else {
        Err(OpsError::Other("opsd is not reachable".to_string()))
    }
}

fn csv(values: &[String]) -> Option<String> {
    (!values.is_empty()).then(|| values.join(","))
}

fn query_params(
    q: Option<String>,
    types: Vec<String>,
    tags: Vec<String>,
    after: Option<String>,
    before: Option<String>,
    limit: i64,
    format: &str,
) -> QueryParams {
    QueryParams {
        q,
        types: (!types.is_empty()).then_some(types),
        tags: (!tags.is_empty()).then_some(tags),
        after,
        before,
        limit,
        format: if format == "full" {
            QueryFormat::Full
        } else {
            QueryFormat::Summary
        },
        order: QueryOrder::Desc,
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn cmd_init() -> Result<i32> {
    let ops_yml = PathBuf::from(obr_config::CONFIG_FILE);
    if !ops_yml.exists() {
        obr_config::write_default_config(&ops_yml)?;
    }
    let config = obr_config::load_config(&ops_yml)?;
    let paths = WorkspacePaths::resolve(&config);
    paths.ensure()?;
    obr_db::init_db(&paths.db)?;
    let conn = obr_db::connect(&paths.db)?;
    obr_db::ensure_builtin_views(&conn, &obr_ids::iso_now(config.tz()?))?;

    println!("Initialized workspace at {}", paths.workspace.display());
    println!("canonical/events.jsonl OK");
    println!("index/brain.sqlite OK");
    Ok(0)
}

// ---------------------------------------------------------------------------
// source
// ---------------------------------------------------------------------------

async fn source(cmd: SourceCmd, client: &OpsdClient, flags: &Flags) -> Result<i32> {
    match cmd {
        SourceCmd::Add {
            name,
            path,
            tags,
            no_copy,
        } => {
            require_online(client).await?;
            let payload = json!({
                "name": name,
                "kind": "chat_json_file",
                "config": {"path": path, "copy": !no_copy},
                "tags": tags,
            });
            print_value(&client.post("/v1/sources", &payload).await?, flags.json);
        }
        SourceCmd::List => {
            if client.is_online().await {
                print_items(&client.get("/v1/sources", &[]).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let conn = ctx.connect()?;
                let items = serde_json::to_value(obr_db::list_sources(&conn)?)
                    .unwrap_or(Value::Array(vec![]));
                print_items(&json!({"items": items}), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
        SourceCmd::Show { name } => {
            if client.is_online().await {
                print_value(&client.get(&format!("/v1/sources/{name}"), &[]).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let conn = ctx.connect()?;
                let source = obr_db::get_source(&conn, &name)?
                    .ok_or_else(|| OpsError::Other("Source not found".to_string()))?;
                print_value(&serde_json::to_value(&source).unwrap_or(Value::Null), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
        SourceCmd::Rm { name } => {
            require_online(client).await?;
            print_value(&client.delete(&format!("/v1/sources/{name}")).await?, flags.json);
        }
        SourceCmd::Test { name } => {
            require_online(client).await?;
            print_value(
                &client.post(&format!("/v1/sources/{name}:test"), &json!({})).await?,
                flags.json,
            );
        }
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// ingest
// ---------------------------------------------------------------------------

async fn ingest(cmd: IngestCmd, client: &OpsdClient, flags: &Flags) -> Result<i32> {
    match cmd {
        IngestCmd::Run {
            name,
            tags,
            dry_run,
        } => {
            if client.is_online().await && !flags.offline {
                let payload = json!({"tags": tags, "dry_run": dry_run});
                print_value(
                    &client.post(&format!("/v1/ingests/{name}:run"), &payload).await?,
                    flags.json,
                );
                return Ok(0);
            }
            if !flags.offline {
                return Err(OpsError::Other(
                    "opsd is not reachable (use --offline to ingest locally)".to_string(),
                ));
            }
            let ctx = LocalCtx::load()?;
            let summary = local::ingest_source(&ctx, &name, &tags, dry_run)?;
            print_value(&serde_json::to_value(&summary).unwrap_or(Value::Null), flags.json);
        }
        IngestCmd::ChatJson {
            path,
            tags,
            copy: _,
            no_copy,
        } => {
            // Bulk ingest is the local path by design; the daemon route for
            // recurring ingests is `source add` + `ingest run`.
            let ctx = LocalCtx::load()?;
            let summary = local::ingest_chat_json(&ctx, &path, &tags, !no_copy)?;
            print_value(&serde_json::to_value(&summary).unwrap_or(Value::Null), flags.json);
        }
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// view
// ---------------------------------------------------------------------------

async fn view(cmd: ViewCmd, client: &OpsdClient, flags: &Flags) -> Result<i32> {
    match cmd {
        ViewCmd::Add {
            name,
            description,
            query,
        } => {
            require_online(client).await?;
            let query: Value = serde_json::from_str(&query)
                .map_err(|e| OpsError::Other(format!("Invalid JSON for --query: {e}")))?;
            let payload = json!({
                "name": name,
                "description": description.unwrap_or_default(),
                "query": query,
            });
            print_value(&client.post("/v1/views", &payload).await?, flags.json);
        }
        ViewCmd::List => {
            if client.is_online().await {
                print_items(&client.get("/v1/views", &[]).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let conn = ctx.connect()?;
                let items =
                    serde_json::to_value(obr_db::list_views(&conn)?).unwrap_or(Value::Array(vec![]));
                print_items(&json!({"items": items}), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
        ViewCmd::Show { name } => {
            if client.is_online().await {
                print_value(&client.get(&format!("/v1/views/{name}"), &[]).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let conn = ctx.connect()?;
                let view = obr_db::get_view(&conn, &name)?
                    .ok_or_else(|| OpsError::Other("View not found".to_string()))?;
                print_value(&serde_json::to_value(&view).unwrap_or(Value::Null), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
        ViewCmd::Rm { name } => {
            require_online(client).await?;
            print_value(&client.delete(&format!("/v1/views/{name}")).await?, flags.json);
        }
        ViewCmd::Query {
            name,
            filters,
            limit,
        } => {
            let filters: Value = match filters {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| OpsError::Other(format!("Invalid JSON for --filters: {e}")))?,
                None => json!({}),
            };
            if client.is_online().await && !flags.offline {
                let payload = json!({"filters": filters, "limit": limit});
                print_items(
                    &client.post(&format!("/v1/views/{name}:query"), &payload).await?,
                    flags.json,
                );
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let items = local::view_query(&ctx, &name, &filters, limit)?;
                print_items(&json!({"items": items}), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// job
// ---------------------------------------------------------------------------

async fn job(cmd: JobCmd, client: &OpsdClient, flags: &Flags) -> Result<i32> {
    match cmd {
        JobCmd::Add {
            name,
            kind,
            config,
            disabled,
        } => {
            require_online(client).await?;
            let payload = json!({
                "name": name,
                "kind": kind,
                "config": parse_config_args(&config)?,
                "enabled": !disabled,
            });
            print_value(&client.post("/v1/jobs", &payload).await?, flags.json);
        }
        JobCmd::List => {
            if client.is_online().await {
                print_items(&client.get("/v1/jobs", &[]).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let conn = ctx.connect()?;
                let items =
                    serde_json::to_value(obr_db::list_jobs(&conn)?).unwrap_or(Value::Array(vec![]));
                print_items(&json!({"items": items}), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
        JobCmd::Show { name } => {
            if client.is_online().await {
                print_value(&client.get(&format!("/v1/jobs/{name}"), &[]).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let conn = ctx.connect()?;
                let job = obr_db::get_job(&conn, &name)?
                    .ok_or_else(|| OpsError::Other("Job not found".to_string()))?;
                print_value(&serde_json::to_value(&job).unwrap_or(Value::Null), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
        JobCmd::Rm { name } => {
            require_online(client).await?;
            print_value(&client.delete(&format!("/v1/jobs/{name}")).await?, flags.json);
        }
        JobCmd::Run { name } => {
            require_online(client).await?;
            print_value(
                &client.post(&format!("/v1/jobs/{name}:run"), &json!({})).await?,
                flags.json,
            );
        }
        JobCmd::Logs { name } => {
            if client.is_online().await {
                print_items(&client.get(&format!("/v1/jobs/{name}/runs"), &[]).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let conn = ctx.connect()?;
                let items = serde_json::to_value(obr_db::list_job_runs(&conn, &name)?)
                    .unwrap_or(Value::Array(vec![]));
                print_items(&json!({"items": items}), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
    }
    Ok(0)
}

fn parse_config_args(values: &[String]) -> Result<Value> {
    if values.is_empty() {
        return Ok(json!({}));
    }
    if values.len() == 1 && values[0].trim_start().starts_with('{') {
        return serde_json::from_str(&values[0])
            .map_err(|e| OpsError::Other(format!("Invalid JSON for --config: {e}")));
    }
    let mut map = serde_json::Map::new();
    for item in values {
        let (key, raw) = item
            .split_once('=')
            .ok_or_else(|| OpsError::Other(format!("Invalid config entry: {item}")))?;
        let value = raw.trim();
        let parsed = if value.eq_ignore_ascii_case("true") {
            Value::Bool(true)
        } else if value.eq_ignore_ascii_case("false") {
            Value::Bool(false)
        } else if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            json!(value.parse::<i64>().unwrap_or_default())
        } else {
            Value::String(value.to_string())
        };
        map.insert(key.trim().to_string(), parsed);
    }
    Ok(Value::Object(map))
}

// ---------------------------------------------------------------------------
// artifact
// ---------------------------------------------------------------------------

async fn artifact(cmd: ArtifactCmd, client: &OpsdClient, flags: &Flags) -> Result<i32> {
    match cmd {
        ArtifactCmd::List { tag, after, before } => {
            if client.is_online().await {
                let mut query: Vec<(&str, String)> = Vec::new();
                if let Some(tag) = tag {
                    query.push(("tag", tag));
                }
                if let Some(after) = after {
                    query.push(("after", after));
                }
                if let Some(before) = before {
                    query.push(("before", before));
                }
                print_items(&client.get("/v1/artifacts", &query).await?, flags.json);
            } else if flags.offline {
                let ctx = LocalCtx::load()?;
                let items = local::list_artifacts(&ctx, tag, after, before)?;
                print_items(&json!({"items": items}), flags.json);
            } else {
                return Err(OpsError::Other("opsd is not reachable".to_string()));
            }
        }
        ArtifactCmd::Pack { tag, out_dir } => {
            require_online(client).await?;
            let payload = json!({"tag": tag, "out_dir": out_dir});
            print_value(&client.post("/v1/artifacts:pack", &payload).await?, flags.json);
        }
        ArtifactCmd::Open { path } => {
            let path = PathBuf::from(path);
            if !path.exists() {
                return Err(OpsError::Other(format!(
                    "Artifact not found: {}",
                    path.display()
                )));
            }
            open_path(&path)?;
        }
    }
    Ok(0)
}

/// OS-specific file open; fire and forget.
fn open_path(path: &std::path::Path) -> Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        let mut c = std::process::Command::new("open");
        c.arg(path);
        c
    } else if cfg!(windows) {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]).arg(path);
        c
    } else {
        let mut c = std::process::Command::new("xdg-open");
        c.arg(path);
        c
    };
    command
        .spawn()
        .map_err(|e| OpsError::Io(format!("Failed to open {}: {e}", path.display())))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// search / query / show / rebuild
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn cmd_search(
    client: &OpsdClient,
    flags: &Flags,
    query: String,
    types: Vec<String>,
    tags: Vec<String>,
    after: Option<String>,
    before: Option<String>,
    limit: i64,
    format: String,
) -> Result<i32> {
    if client.is_online().await && !flags.offline {
        let mut params: Vec<(&str, String)> = vec![("q", query), ("limit", limit.to_string())];
        if let Some(types) = csv(&types) {
            params.push(("type", types));
        }
        if let Some(tags) = csv(&tags) {
            params.push(("tag", tags));
        }
        if let Some(after) = after {
            params.push(("after", after));
        }
        if let Some(before) = before {
            params.push(("before", before));
        }
        params.push(("format", format));
        print_items(&client.get("/v1/events", &params).await?, flags.json);
        return Ok(0);
    }
    if !flags.offline {
        return Err(OpsError::Other("opsd is not reachable".to_string()));
    }
    let ctx = LocalCtx::load()?;
    let params = query_params(Some(query), types, tags, after, before, limit, &format);
    let items = local::search(&ctx, &params, false)?;
    print_items(&json!({"items": items}), flags.json);
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
fn cmd_query(
    flags: &Flags,
    query: String,
    types: Vec<String>,
    tags: Vec<String>,
    after: Option<String>,
    before: Option<String>,
    limit: i64,
    format: String,
) -> Result<i32> {
    let ctx = LocalCtx::load()?;
    let params = query_params(Some(query), types, tags, after, before, limit, &format);
    let items = local::search(&ctx, &params, true)?;
    print_value(&Value::Array(items), flags.json);
    Ok(0)
}

async fn cmd_event_show(client: &OpsdClient, flags: &Flags, event_id: &str) -> Result<i32> {
    if client.is_online().await && !flags.offline {
        print_value(&client.get(&format!("/v1/events/{event_id}"), &[]).await?, flags.json);
        return Ok(0);
    }
    if !flags.offline {
        return Err(OpsError::Other("opsd is not reachable".to_string()));
    }
    let ctx = LocalCtx::load()?;
    print_value(&local::show_event(&ctx, event_id)?, flags.json);
    Ok(0)
}

fn cmd_rebuild(flags: &Flags, wipe: bool, fts: bool, from: Option<String>) -> Result<i32> {
    let ctx = LocalCtx::load()?;
    let counts = local::rebuild(&ctx, wipe, fts, from.map(PathBuf::from))?;
    if flags.json {
        print_value(&serde_json::to_value(counts).unwrap_or(Value::Null), true);
    } else {
        println!("Events processed: {}", counts.processed);
        println!("Inserted: {}", counts.inserted);
        println!("Skipped: {}", counts.skipped);
        println!("Parse errors: {}", counts.parse_errors);
    }
    Ok(0)
}
