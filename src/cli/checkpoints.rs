// src/cli/checkpoints.rs
//! Checkpoints command - inspect and restore persisted file snapshots

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use crate::checkpoint::{CheckpointMetadata, CheckpointStore, RestoreMode};

use super::output::format_output;

/// Checkpoints command arguments
#[derive(Args)]
pub struct CheckpointsArgs {
    /// Project directory (defaults to the current directory)
    #[arg(long, short)]
    pub project: Option<PathBuf>,

    /// Output JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: CheckpointCommand,
}

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List checkpoints, newest first
    List,
    /// Show one checkpoint and the files it holds
    Show { id: String },
    /// Write a checkpoint's files back to disk
    Restore {
        id: String,
        /// original (before the tool ran) or current (after)
        #[arg(long, default_value = "original")]
        mode: RestoreMode,
        /// Restore only these files
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Delete one checkpoint
    Delete { id: String },
    /// Delete all but the newest checkpoints
    Clean {
        #[arg(long, default_value = "50")]
        keep: usize,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointDetail {
    #[serde(flatten)]
    metadata: CheckpointMetadata,
    files: Vec<String>,
}

pub fn handle_checkpoints(args: CheckpointsArgs) -> Result<()> {
    let project = match args.project {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    let store = CheckpointStore::new(project);

    match args.command {
        CheckpointCommand::List => {
            let checkpoints = store.list()?;
            if args.json {
                println!("{}", format_output(&checkpoints, true));
            } else if checkpoints.is_empty() {
                println!("No checkpoints");
            } else {
                for cp in &checkpoints {
                    println!(
                        "{}  {}  {} files  {}",
                        cp.id,
                        cp.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        cp.file_count,
                        cp.trigger.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        CheckpointCommand::Show { id } => {
            let detail = CheckpointDetail {
                metadata: store.metadata(&id)?,
                files: store.files(&id)?,
            };
            if args.json {
                println!("{}", format_output(&detail, true));
            } else {
                println!(
                    "{} ({})",
                    detail.metadata.id,
                    detail.metadata.name.as_deref().unwrap_or(&detail.metadata.checkpoint_type)
                );
                if let Some(branch) = &detail.metadata.git_branch {
                    println!("branch: {}", branch);
                }
                for file in &detail.files {
                    println!("  {}", file);
                }
            }
        }
        CheckpointCommand::Restore { id, mode, files } => {
            if files.is_empty() {
                let count = store.restore(&id, mode)?;
                println!("Restored {} files from {}", count, id);
            } else {
                store.restore_files(&id, &files, mode)?;
                println!("Restored {} files from {}", files.len(), id);
            }
        }
        CheckpointCommand::Delete { id } => {
            store.delete(&id)?;
            println!("Deleted {}", id);
        }
        CheckpointCommand::Clean { keep } => {
            let removed = store.clean_old(keep)?;
            println!("Removed {} checkpoints", removed);
        }
    }
    Ok(())
}
