// src/cli/run.rs
//! Run command - drive a live agent session from the terminal
//!
//! Prompts come from the command line, then from stdin one per line. Ctrl-C
//! interrupts the running turn; a second Ctrl-C while idle exits.

use anyhow::{anyhow, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::adapter::{Backend, TurnOptions, TurnRequest};
use crate::config::EngineConfig;
use crate::event::Event;
use crate::process::CommandLauncher;
use crate::session::{Session, TurnStatus};

use super::output::{event_json_line, render_event};

/// Run command arguments
#[derive(Args)]
pub struct RunArgs {
    /// Backend: claude, codex, gemini, qwen
    #[arg(long, short, default_value = "claude")]
    pub backend: Backend,

    /// Working directory
    #[arg(long, short = 'c')]
    pub cwd: Option<String>,

    /// Model override
    #[arg(long, short)]
    pub model: Option<String>,

    /// Keep reading prompts from stdin after the first turn
    #[arg(long, short)]
    pub interactive: bool,

    /// One JSON event per line
    #[arg(long)]
    pub json: bool,

    /// Initial prompt
    pub prompt: Option<String>,
}

/// Expand `~/` and default to the current directory.
fn resolve_cwd(cwd: Option<String>) -> Result<PathBuf> {
    let path = match cwd {
        Some(p) => match p.strip_prefix("~/") {
            Some(rest) => dirs::home_dir().map(|h| h.join(rest)).unwrap_or_else(|| PathBuf::from(&p)),
            None => PathBuf::from(p),
        },
        None => std::env::current_dir()?,
    };
    if !Path::new(&path).is_dir() {
        return Err(anyhow!("Working directory does not exist: {}", path.display()));
    }
    Ok(path)
}

pub async fn handle_run(args: RunArgs, config: EngineConfig) -> Result<()> {
    let cwd = resolve_cwd(args.cwd)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    let session = Session::new(
        session_id.clone(),
        args.backend,
        cwd,
        config,
        Arc::new(CommandLauncher::new()),
    );
    info!(session_id = %session_id, backend = %args.backend, "Session started");

    let printer = tokio::spawn(print_events(session.subscribe(), args.json));
    let options = TurnOptions {
        model: args.model.clone(),
        ..Default::default()
    };
    let submit = |prompt: String| -> Result<()> {
        match session.run_turn(TurnRequest::new(prompt).with_options(options.clone()))? {
            TurnStatus::Started { turn_id } => info!(turn_id = %turn_id, "Turn started"),
            TurnStatus::Queued { turn_id, position } => info!(turn_id = %turn_id, position, "Turn queued"),
        }
        Ok(())
    };

    if let Some(prompt) = args.prompt {
        submit(prompt)?;
    } else if !args.interactive {
        return Err(anyhow!("A prompt is required unless --interactive is set"));
    }

    if args.interactive {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => submit(line)?,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    if !session.interrupt().await {
                        break;
                    }
                }
            }
        }
    }

    loop {
        tokio::select! {
            _ = session.wait_idle() => break,
            _ = tokio::signal::ctrl_c() => {
                if !session.interrupt().await {
                    break;
                }
            }
        }
    }

    let usage = session.usage().await;
    // closing the session closes the event channel once the printer drains it
    drop(session);
    let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
    if args.json {
        println!("{}", serde_json::to_string(&usage)?);
    } else {
        eprintln!(
            "tokens in {} / out {}, ${:.4}",
            usage.tokens_in, usage.tokens_out, usage.usd
        );
    }
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<Event>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if json {
                    println!("{}", event_json_line(&event));
                } else if let Some(line) = render_event(&event) {
                    println!("{}", line);
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_cwd_rejects_missing_dir() {
        let err = resolve_cwd(Some("/definitely/not/here".into())).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_cwd_accepts_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_cwd(Some(dir.path().to_string_lossy().into_owned())).unwrap();
        assert_eq!(path, dir.path());
    }
}
