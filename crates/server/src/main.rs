use std::net::SocketAddr;

use anyhow::Context;
use server::{AppState, start_server};
use services::services::materializer::MaterializerService;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},utils={level}",
        level = log_level
    );
    let filter = EnvFilter::try_new(&filter_string).context("Failed to create tracing filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = db::DBService::new().await?;
    tracing::info!("Database ready");

    MaterializerService::spawn(db.pool.clone());

    let state = AppState::new(db);
    state.spawn_resync();

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(3001);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("Invalid HOST/PORT")?;

    let (local_addr, handle) = start_server(state, addr).await?;
    tracing::info!("Server running on http://{local_addr}");

    handle.await?;
    Ok(())
}
