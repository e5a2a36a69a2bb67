use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sitesmith::server::{start_server, ServerConfig};

#[derive(Parser)]
#[command(name = "sitesmith")]
#[command(version, about = "Hosted code generation service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the sitesmith server
    Serve {
        #[arg(short, long, default_value_t = 4141)]
        port: u16,

        /// Path to the SQLite database file
        #[arg(long, default_value = "sitesmith.db")]
        db: PathBuf,

        /// Bind on all interfaces and allow any origin
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sitesmith=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port, db, dev } => {
            start_server(ServerConfig {
                port,
                db_path: db,
                dev_mode: dev,
            })
            .await
        }
    }
}
