use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clawchat")]
#[command(about = "Multi-gateway chat proxy for OpenClaw gateways", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    #[command(about = "Start the proxy server (default)")]
    Serve {
        /// Bind address; falls back to HOST, then 127.0.0.1.
        #[arg(long)]
        host: Option<String>,
        /// Bind port; falls back to PORT, then 8800.
        #[arg(long)]
        port: Option<u16>,
        /// Store path; falls back to DATABASE_PATH, then data/chat.db.
        #[arg(long)]
        database: Option<PathBuf>,
        /// Extra allowed CORS origins, on top of CORS_ORIGINS.
        #[arg(long)]
        cors: Vec<String>,
    },
}
