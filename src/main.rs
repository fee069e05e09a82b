use std::sync::Arc;

use axum::{routing::get, Router};
use log::info;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use backend::config::{Config, RoomConfig};
use backend::registry::RoomRegistry;
use backend::server::start_ws_server;
use backend::store::MemoryStore;

async fn health_check() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::init();
    info!("Starting HoroQuiz live session backend");

    let config = Config::from_env()?;
    let store = Arc::new(MemoryStore::new());
    let registry = RoomRegistry::new(store, RoomConfig::default());

    let ws_listener = TcpListener::bind(config.ws_addr).await?;
    let ws_server = start_ws_server(ws_listener, registry);

    let health_app = Router::new()
        .route("/health", get(health_check))
        .layer(CorsLayer::new().allow_origin(Any));
    let health_listener = TcpListener::bind(config.health_addr).await?;

    tokio::select! {
        _ = ws_server => {},
        _ = axum::serve(health_listener, health_app) => {},
    }

    Ok(())
}
