//! Agent Stream CLI
//!
//! Replays captured agent transcripts, drives live agent sessions and manages
//! file checkpoints.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

use agent_stream::cli::{CheckpointsArgs, ReplayArgs, RunArgs, SanitizeArgs};
use agent_stream::config::EngineConfig;

#[derive(Parser)]
#[command(name = "agent-stream")]
#[command(about = "Reconcile coding-agent output streams into one ordered event log")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $AGENT_STREAM_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a captured stdout transcript and print the reconciled log
    Replay(ReplayArgs),
    /// Strip terminal noise from a captured transcript
    Sanitize(SanitizeArgs),
    /// Run an agent and stream its reconciled events
    Run(RunArgs),
    /// Inspect and restore file checkpoints
    Checkpoints(CheckpointsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=debug agent-stream run ...
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_stream=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };
    debug!(?config, "Config loaded");

    match cli.command {
        Commands::Replay(args) => agent_stream::cli::handle_replay(args, &config)?,
        Commands::Sanitize(args) => agent_stream::cli::handle_sanitize(args)?,
        Commands::Run(args) => agent_stream::cli::handle_run(args, config).await?,
        Commands::Checkpoints(args) => agent_stream::cli::handle_checkpoints(args)?,
    }

    Ok(())
}
