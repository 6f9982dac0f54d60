mod error;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::*;
use crate::state::{create_default_config, load_config, AppState, Gateway};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "gateway.toml")]
    config: PathBuf,
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,
}

fn build_router(state: std::sync::Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route(
            "/adapters/:name/mcp",
            post(streamable_post)
                .get(streamable_get)
                .delete(streamable_delete),
        )
        .route("/adapters/:name/messages", post(legacy_messages))
        .route("/adapters/:name/sse", get(legacy_sse))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if !args.config.exists() {
        warn!("config file missing, creating default config");
        create_default_config(&args.config)?;
    }

    let config = load_config(&args.config)?;
    let shutdown = CancellationToken::new();
    let Gateway { state, tasks } = Gateway::from_config(&config, shutdown.clone()).await?;
    let app = build_router(state);

    info!("mcp-gateway listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            _ = signal.cancelled() => {}
        }
        signal.cancel();
    })
    .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    info!("mcp-gateway stopped");
    Ok(())
}
