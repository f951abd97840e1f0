use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use clawchat_gateway::GatewayManager;
use clawchat_server::{run_server, AppState};
use clawchat_storage::{Database, GatewayRepository};
use cli::{Cli, Commands};

const DEFAULT_PORT: u16 = 8800;
const DEFAULT_DATABASE_PATH: &str = "data/chat.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve {
            host,
            port,
            database,
            cors,
        }) => serve(host, port, database, cors).await,
        None => serve(None, None, None, Vec::new()).await,
    }
}

async fn serve(
    host: Option<String>,
    port: Option<u16>,
    database: Option<PathBuf>,
    mut cors_origins: Vec<String>,
) -> anyhow::Result<()> {
    let host = host
        .or_else(|| std::env::var("HOST").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT);
    let database = database
        .or_else(|| std::env::var("DATABASE_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));

    if let Ok(raw) = std::env::var("CORS_ORIGINS") {
        cors_origins.extend(split_origins(&raw));
    }

    // Store failures here are unrecoverable; bubbling up exits non-zero.
    let db = Database::new(&database).await?;

    let manager = Arc::new(GatewayManager::new(GatewayRepository::new(
        db.pool().clone(),
    )));

    if let Ok(url) = std::env::var("DEFAULT_GATEWAY_URL") {
        let url = url.trim();
        if !url.is_empty() {
            manager.seed_default(url).await?;
        }
    }

    manager.start().await?;

    let state = Arc::new(AppState::new(&db, manager.clone()));
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    run_server(addr, state, cors_origins, async move {
        let _ = shutdown_rx.await;
    })
    .await?;

    // Stop accepting first, then drain upstream connections so pending
    // requests flush before exit.
    manager.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_split_and_trim() {
        assert_eq!(
            split_origins(" http://a:3000 ,, http://b:5173"),
            vec!["http://a:3000".to_string(), "http://b:5173".to_string()]
        );
        assert!(split_origins("").is_empty());
    }
}
