//! opsd entry point: tracing, bind address, serve. Everything else lives in
//! the library so `ops serve` can embed the same daemon.

use obr_daemon::{serve, DEFAULT_HOST, DEFAULT_PORT};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let host = std::env::var("OPSD_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
    let port = std::env::var("OPSD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    serve(&host, port).await
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
