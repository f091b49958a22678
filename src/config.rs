//! Engine configuration
//!
//! Read from `$AGENT_STREAM_CONFIG`, else `<config dir>/agent-stream/config.json`.
//! Every section and field is optional; missing values fall back to defaults.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "AGENT_STREAM_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub log: LogConfig,
    pub telemetry: TelemetryConfig,
    pub supervisor: SupervisorConfig,
    pub checkpoints: CheckpointConfig,
}

/// Session event log bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// Cap on rendered events
    pub max_events: usize,
    /// Cap on reconciled messages
    pub max_messages: usize,
    /// How many recent assistant replies an identical re-emission is checked against
    pub recent_dedup_window: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_events: 50_000,
            max_messages: 10_000,
            recent_dedup_window: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetryConfig {
    pub poll_interval_ms: u64,
    /// Largest unterminated block held back before it is released as prose
    pub max_pending_bytes: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300,
            max_pending_bytes: 1024 * 1024,
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// How long an interrupted process gets before the turn is abandoned
    pub interrupt_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interrupt_grace_ms: 2_000,
        }
    }
}

impl SupervisorConfig {
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Also write checkpoints to `<project>/.agent-stream/checkpoints`
    pub persist: bool,
    pub max_snapshot_bytes: u64,
    /// Persisted checkpoints kept per project
    pub keep: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist: false,
            max_snapshot_bytes: 2 * 1024 * 1024,
            keep: 50,
        }
    }
}

impl EngineConfig {
    /// Load from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content).map_err(|e| anyhow!("Invalid config {}: {}", path.display(), e))
    }

    /// Load from the default location, or defaults when no file exists
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::config_dir().map(|d| d.join("agent-stream").join("config.json"))
    }
}
