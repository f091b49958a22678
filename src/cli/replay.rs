// src/cli/replay.rs
//! Replay and sanitize commands - run a captured agent transcript through the engine offline

use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::PathBuf;

use crate::adapter::Backend;
use crate::config::EngineConfig;
use crate::event::Event;
use crate::infra::Sanitizer;
use crate::session::{SessionEventLog, StreamPipeline};

use super::output::{event_json_line, render_event};

/// Replay command arguments
#[derive(Args)]
pub struct ReplayArgs {
    /// Backend that produced the transcript: claude, codex, gemini, qwen
    #[arg(long, short)]
    pub backend: Backend,

    /// Captured stdout
    pub file: PathBuf,

    /// Side-channel telemetry file written during the same run
    #[arg(long)]
    pub telemetry: Option<PathBuf>,

    /// Directory relative tool paths resolve against for snapshots
    #[arg(long, short = 'c')]
    pub cwd: Option<PathBuf>,

    /// Print the raw event stream instead of the reconciled log
    #[arg(long)]
    pub events: bool,

    /// One JSON event per line
    #[arg(long)]
    pub json: bool,
}

/// Sanitize command arguments
#[derive(Args)]
pub struct SanitizeArgs {
    #[arg(long, short)]
    pub backend: Backend,

    pub file: PathBuf,
}

/// Feed a transcript through a fresh pipeline and return the raw event stream.
pub fn replay_events(args: &ReplayArgs, config: &EngineConfig) -> Result<Vec<Event>> {
    let stdout = fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    let cwd = match &args.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir()?,
    };

    let mut pipeline = StreamPipeline::new(args.backend, cwd, config);
    pipeline.begin_turn("replay");
    let mut events = pipeline.feed(&stdout);
    if let Some(path) = &args.telemetry {
        let telemetry =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        events.extend(pipeline.ingest_telemetry(&telemetry));
    }
    events.extend(pipeline.finish(Some(0)));
    Ok(events)
}

pub fn handle_replay(args: ReplayArgs, config: &EngineConfig) -> Result<()> {
    let events = replay_events(&args, config)?;
    let output = if args.events {
        events
    } else {
        let mut log = SessionEventLog::new(config.log.clone());
        for event in events {
            log.append(event);
        }
        log.snapshot()
    };

    for event in &output {
        if args.json {
            println!("{}", event_json_line(event));
        } else if let Some(line) = render_event(event) {
            println!("{}", line);
        }
    }
    Ok(())
}

pub fn handle_sanitize(args: SanitizeArgs) -> Result<()> {
    let raw = fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    print!("{}", Sanitizer::for_backend(args.backend).sanitize(&raw));
    Ok(())
}
