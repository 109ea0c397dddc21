//! # Atlas CLI (`atlas`)
//!
//! Serves a dataset to the embedding visualization UI, or writes a static
//! archive of it.
//!
//! ## Usage
//!
//! ```bash
//! atlas --config ./config/atlas.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `atlas serve` | Load the dataset and start the HTTP server |
//! | `atlas export --output <zip>` | Write the static archive and exit |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use atlas_serve::{config, export, server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Atlas: data-serving and similarity-search backend for embedding
/// visualizations.
#[derive(Parser)]
#[command(
    name = "atlas",
    about = "Serve a dataset to the embedding visualization UI",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/atlas.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve {
        /// Override `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Write the self-contained static archive.
    Export {
        /// Destination zip file.
        #[arg(long, short)]
        output: PathBuf,
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
    let mut cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            server::run_server(&cfg).await?;
        }
        Commands::Export { output } => {
            export::run_export(&cfg, &output).await?;
            println!("Archive written to {}", output.display());
        }
    }

    Ok(())
}
