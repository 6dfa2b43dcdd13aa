//! devloop-ui - HTTP control surface for devloop workspaces.
//!
//! Serves the workspace/engine API under `/api` and a live event stream at
//! `/events`.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use devloop::io::config::{DEFAULT_CONFIG_FILE, load_config};
use devloop::workspace::WorkspaceCoordinator;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "devloop-ui")]
#[command(about = "HTTP API and event stream for driving devloop workspaces")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Preferences shared by every workspace's engine
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devloop_ui=info".parse()?)
                .add_directive("devloop=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let preferences = Arc::new(load_config(&args.config)?);
    info!(config = %args.config.display(), "starting devloop-ui");

    let coordinator = Arc::new(WorkspaceCoordinator::production(preferences));
    let state = AppState::new(coordinator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
