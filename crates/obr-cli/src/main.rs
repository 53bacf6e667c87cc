//! `ops`: the CLI shell over the same core the daemon serves. Data commands
//! probe `GET /health` first and prefer the daemon; offline mode works
//! against the local index (reads, plus the locked local ingest path).
//! Exit codes: 0 ok, 2 argument errors (clap), then the error taxonomy
//! (10 config, 20 adapter, 30 database, 40 io, 50 other).

use clap::{Parser, Subcommand};

mod client;
mod commands;
mod local;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:7777";

#[derive(Parser)]
#[command(name = "ops")]
#[command(about = "Local ops brain: durable event store, search, jobs", long_about = None)]
pub struct Cli {
    /// opsd endpoint
    #[arg(long, global = true, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Work against the local index without the daemon
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the workspace and a default ops.yml
    Init,

    /// Run the opsd daemon
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 7777)]
        port: u16,
    },

    /// Source CRUD (daemon-backed)
    Source {
        #[command(subcommand)]
        cmd: SourceCmd,
    },

    /// Ingest chat records
    Ingest {
        #[command(subcommand)]
        cmd: IngestCmd,
    },

    /// Saved views
    View {
        #[command(subcommand)]
        cmd: ViewCmd,
    },

    /// Jobs and job runs
    Job {
        #[command(subcommand)]
        cmd: JobCmd,
    },

    /// Artifact listing / packing / opening
    Artifact {
        #[command(subcommand)]
        cmd: ArtifactCmd,
    },

    /// Search events (daemon-preferred)
    Search {
        query: String,
        #[arg(long = "type")]
        types: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        before: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value = "summary")]
        format: String,
    },

    /// Search the local index directly (FTS with LIKE fallback)
    Query {
        query: String,
        #[arg(long = "type")]
        types: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        before: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value = "summary")]
        format: String,
    },

    /// Event inspection
    Event {
        #[command(subcommand)]
        cmd: EventCmd,
    },

    /// Show one event from the local index (shorthand for `event show`)
    Show { event_id: String },

    /// Index maintenance
    Index {
        #[command(subcommand)]
        cmd: IndexCmd,
    },
}

#[derive(Subcommand)]
pub enum SourceCmd {
    Add {
        name: String,
        #[arg(long)]
        path: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        no_copy: bool,
    },
    List,
    Show { name: String },
    Rm { name: String },
    Test { name: String },
}

#[derive(Subcommand)]
pub enum IngestCmd {
    /// Run a stored source through the daemon (or locally with --offline)
    Run {
        name: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Offline bulk ingest of a chat-JSON file
    #[command(name = "chat_json")]
    ChatJson {
        path: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long, overrides_with = "no_copy")]
        copy: bool,
        #[arg(long)]
        no_copy: bool,
    },
}

#[derive(Subcommand)]
pub enum ViewCmd {
    Add {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        query: String,
    },
    List,
    Show { name: String },
    Rm { name: String },
    Query {
        name: String,
        #[arg(long)]
        filters: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
pub enum JobCmd {
    Add {
        name: String,
        #[arg(long)]
        kind: String,
        #[arg(long = "config")]
        config: Vec<String>,
        #[arg(long)]
        disabled: bool,
    },
    List,
    Show { name: String },
    Rm { name: String },
    Run { name: String },
    Logs { name: String },
}

#[derive(Subcommand)]
pub enum ArtifactCmd {
    List {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        before: Option<String>,
    },
    Pack {
        #[arg(long)]
        tag: String,
        #[arg(long)]
        out_dir: String,
    },
    Open { path: String },
}

#[derive(Subcommand)]
pub enum EventCmd {
    Show { event_id: String },
}

#[derive(Subcommand)]
pub enum IndexCmd {
    /// Replay the canonical log into the index
    Rebuild {
        #[arg(long)]
        wipe: bool,
        #[arg(long)]
        fts: bool,
        /// Replay a different log file instead of the workspace log
        #[arg(long)]
        from: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    match commands::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn init_tracing() {
    // stdout is for command output; diagnostics go to stderr and stay quiet
    // unless RUST_LOG says otherwise.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}
