//! Agent process launching
//!
//! A `TurnLauncher` turns a `TurnInput` into a running turn: a stdout byte
//! stream, an optional stdin for protocol replies, a kill switch and a channel
//! that resolves with the exit code. `CommandLauncher` does this with
//! `tokio::process`; tests substitute in-memory streams.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::TurnInput;

/// One launched turn
pub struct LaunchedTurn {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Present when the input carried stdin; stays open for replies
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Cancel to stop the process
    pub kill: CancellationToken,
    /// Resolves with the exit code, `None` when killed by a signal
    pub exit: oneshot::Receiver<Option<i32>>,
}

pub trait TurnLauncher: Send + Sync {
    /// Start the process for one turn. Must be called inside a tokio runtime.
    fn launch(&self, input: &TurnInput) -> Result<LaunchedTurn>;
}

/// Resolve an agent executable on `PATH`, falling back to the bare name.
pub fn resolve_program(program: &str) -> PathBuf {
    which::which(program).unwrap_or_else(|_| PathBuf::from(program))
}

/// Launches agent CLIs as child processes
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl TurnLauncher for CommandLauncher {
    fn launch(&self, input: &TurnInput) -> Result<LaunchedTurn> {
        let program = resolve_program(&input.program);
        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&input.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if input.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        if let Some(cwd) = &input.cwd {
            cmd.current_dir(cwd);
        }

        debug!(program = %program.display(), args = ?input.args, "Spawning agent");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;

        let stdout = child.stdout.take().context("Agent stdout not captured")?;
        let stdin = match (child.stdin.take(), &input.stdin) {
            (Some(mut pipe), Some(text)) => {
                let text = text.clone();
                let (reader, writer) = tokio::io::duplex(64 * 1024);
                // feed the initial payload first, then forward replies
                tokio::spawn(async move {
                    if let Err(e) = pipe.write_all(text.as_bytes()).await {
                        warn!(error = %e, "Failed to write agent stdin");
                        return;
                    }
                    let mut reader = reader;
                    if let Err(e) = tokio::io::copy(&mut reader, &mut pipe).await {
                        debug!(error = %e, "Agent stdin closed");
                    }
                });
                Some(Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>)
            }
            _ => None,
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stderr = %line, "Agent stderr");
                }
            });
        }

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let token = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "Kill failed, process may have exited");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(error = %e, "Waiting on agent failed");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(LaunchedTurn {
            stdout: Box::new(stdout),
            stdin,
            kill,
            exit: exit_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_resolve_program_falls_back_to_name() {
        let path = resolve_program("definitely-not-an-agent-binary");
        assert_eq!(path, PathBuf::from("definitely-not-an-agent-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_captures_stdout_and_exit() {
        let input = TurnInput::new("sh").arg("-c").arg("echo hello; exit 3");
        let mut turn = CommandLauncher::new().launch(&input).unwrap();
        let mut out = String::new();
        turn.stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(turn.exit.await.unwrap(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_stops_process() {
        let input = TurnInput::new("sh").arg("-c").arg("sleep 30");
        let turn = CommandLauncher::new().launch(&input).unwrap();
        turn.kill.cancel();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), turn.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, None);
    }
}
