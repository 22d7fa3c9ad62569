// Payment References - Web Server

use anyhow::{Context, Result};
use payref::api::{router, AppState};
use payref::{setup_database, Config};
use rusqlite::Connection;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    payref::logging::init(&config.log_level);

    let conn = Connection::open(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;
    setup_database(&conn)?;
    info!(path = ?config.database_path, "database opened");

    let app = router(AppState::new(conn, config.creditor.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;

    info!(address = %config.bind_address, "server running");

    axum::serve(listener, app)
        .await
        .context("Server stopped with an error")?;

    Ok(())
}
