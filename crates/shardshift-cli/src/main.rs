//! Shardshift - run Elasticsearch migrations from the command line.
//!
//! Loads the migration list from a JSON configuration file, keeps progress in
//! a SQLite state database, and ticks migrations against the configured
//! cluster.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "shardshift")]
#[command(about = "Resumable batched migrations for Elasticsearch")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "shardshift.json")]
    config: PathBuf,

    /// State database (overrides `state_path` from the configuration)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Tick until every migration completes or one halts
    Run {
        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<usize>,
    },
    /// Run a single tick of the current migration
    Tick,
    /// Show every migration and its checkpoint
    Status,
    /// Clear a migration's progress so it starts over
    Reset {
        /// Migration version
        version: u64,
    },
    /// Pause indexing
    Pause,
    /// Resume indexing
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Loading configuration from {}", args.config.display());
    let app = commands::App::build(&args.config, args.state.as_deref())?;

    let result = match args.command {
        Command::Run { max_ticks } => app.run(max_ticks).await,
        Command::Tick => app.tick().await,
        Command::Status => app.status(),
        Command::Reset { version } => app.reset(version),
        Command::Pause => app.set_paused(true),
        Command::Resume => app.set_paused(false),
    };

    app.shutdown().await;
    result
}
