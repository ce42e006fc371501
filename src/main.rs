//! Lodestone server CLI.
//!
//! ```bash
//! lodestone serve --dim 128 --data-dir ./data --port 8080
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lodestone::api::create_router;
use lodestone::{DbConfig, Metric, VectorDatabase};

#[derive(Parser)]
#[command(name = "lodestone")]
#[command(about = "A persistent, single-node vector database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Vector dimension for every index
        #[arg(long)]
        dim: usize,

        /// Data directory (scalar store, WAL, snapshots)
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// Live-point capacity for the graph index
        #[arg(long, default_value = "100000")]
        max_elements: usize,

        /// Distance metric: L2 or INNER_PRODUCT
        #[arg(long, default_value = "L2")]
        metric: Metric,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Server port
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            dim,
            data_dir,
            max_elements,
            metric,
            host,
            port,
        } => {
            let mut config = DbConfig::from_data_dir(&data_dir, dim);
            config.max_elements = max_elements;
            config.metric = metric;

            tracing::info!(
                dim,
                max_elements,
                ?metric,
                data_dir = %data_dir.display(),
                "opening database"
            );
            let db = Arc::new(VectorDatabase::open(&config)?);

            tracing::info!("recovering from snapshot and WAL");
            db.reload_database()?;
            tracing::info!(
                current_seq = db.current_seq(),
                last_snapshot_seq = db.last_snapshot_seq(),
                "recovery complete"
            );

            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            tracing::info!(%addr, "serving");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, create_router(db)).await?;
        }
    }

    Ok(())
}
