use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use blackbelt_server::{build_router, AppState};
use blackbelt_store::SqliteStore;

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,blackbelt_server=info")),
        )
        .init();

    let db_path = std::env::var("BLACKBELT_SQLITE_DB").unwrap_or_else(|_| "blackbelt.db".into());
    let addr = std::env::var("BLACKBELT_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());

    let store = Arc::new(SqliteStore::new(&db_path)?);
    let state = AppState::new(store);

    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(build_router(state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("blackbelt server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
