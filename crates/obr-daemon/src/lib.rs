//! opsd: the workspace daemon. Routes live in `routes.rs`, shared state in
//! `state.rs`, DTOs and error mapping in `api_types.rs`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod api_types;
pub mod routes;
pub mod state;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7777;

/// Boot the workspace from `ops.yml` in the current directory and serve
/// until the process is stopped. Refuses to start when another daemon holds
/// the instance lock.
pub async fn serve(host: &str, port: u16) -> anyhow::Result<()> {
    let config = obr_config::load_config(Path::new(obr_config::CONFIG_FILE))?;
    let ctx = state::ServerContext::init(config)?;

    let app = routes::build_router(Arc::clone(&ctx))
        .layer(TraceLayer::new_for_http())
        .layer(cors_localhost_only());

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {host}:{port}: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("opsd listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
    ];
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
