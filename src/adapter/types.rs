// src/adapter/types.rs
//! Shared adapter types: backends, protocol families and turn encoding

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Supported agent backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Claude,
    Codex,
    Gemini,
    Qwen,
}

impl Backend {
    /// Executable the bundled launcher looks up on `PATH`
    pub fn program(&self) -> &'static str {
        match self {
            Backend::Claude => "claude",
            Backend::Codex => "codex",
            Backend::Gemini => "gemini",
            Backend::Qwen => "qwen",
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        match self {
            Backend::Claude => ProtocolFamily::StructuredLine,
            Backend::Codex => ProtocolFamily::ThreadEvent,
            Backend::Gemini | Backend::Qwen => ProtocolFamily::RawTextWithTelemetry,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Claude => write!(f, "claude"),
            Backend::Codex => write!(f, "codex"),
            Backend::Gemini => write!(f, "gemini"),
            Backend::Qwen => write!(f, "qwen"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" | "claudecode" => Ok(Backend::Claude),
            "codex" => Ok(Backend::Codex),
            "gemini" | "gemini-cli" | "geminicli" => Ok(Backend::Gemini),
            "qwen" | "qwen-code" | "qwencode" => Ok(Backend::Qwen),
            _ => Err(anyhow!("Unknown backend: {}", s)),
        }
    }
}

/// Output protocol family; adapters are written per family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    /// One JSON object per line (`system` / `assistant` / `user` / `result`)
    StructuredLine,
    /// `thread.*` / `turn.*` / `item.*` lines, or the `{id, msg}` proto envelope
    ThreadEvent,
    /// Plain prose with embedded telemetry objects and a telemetry outfile
    RawTextWithTelemetry,
}

/// Tool approval policy requested for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    OnRequest,
    OnFailure,
    Never,
    UnlessTrusted,
}

impl ApprovalPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on-request" => Some(ApprovalPolicy::OnRequest),
            "on-failure" => Some(ApprovalPolicy::OnFailure),
            "never" => Some(ApprovalPolicy::Never),
            "unless-trusted" => Some(ApprovalPolicy::UnlessTrusted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalPolicy::OnRequest => "on-request",
            ApprovalPolicy::OnFailure => "on-failure",
            ApprovalPolicy::Never => "never",
            ApprovalPolicy::UnlessTrusted => "unless-trusted",
        }
    }
}

/// Filesystem sandbox requested for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read-only" => Some(SandboxMode::ReadOnly),
            "workspace-write" => Some(SandboxMode::WorkspaceWrite),
            "danger-full-access" => Some(SandboxMode::DangerFullAccess),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }
}

/// Per-turn options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOptions {
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub sandbox_mode: Option<SandboxMode>,
    pub show_reasoning: Option<bool>,
}

/// One user turn as submitted by the UI layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    pub prompt: String,
    pub images: Vec<String>,
    pub options: TurnOptions,
}

/// JSON payload shape sent by the UI
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendPayload {
    current_message: String,
    #[serde(default)]
    images: Vec<String>,
    model: Option<String>,
    effort: Option<String>,
    approval_policy: Option<String>,
    sandbox_mode: Option<String>,
    show_reasoning: Option<bool>,
    codex_options: Option<CodexOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodexOptions {
    show_reasoning: Option<bool>,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }

    /// Parse a UI payload; anything that is not the JSON payload shape is
    /// taken verbatim as the prompt.
    pub fn from_payload(input: &str) -> Self {
        match serde_json::from_str::<SendPayload>(input) {
            Ok(payload) => Self {
                prompt: payload.current_message,
                images: payload.images,
                options: TurnOptions {
                    cwd: None,
                    model: payload.model,
                    effort: payload.effort,
                    approval_policy: payload.approval_policy.as_deref().and_then(ApprovalPolicy::parse),
                    sandbox_mode: payload.sandbox_mode.as_deref().and_then(SandboxMode::parse),
                    show_reasoning: payload
                        .show_reasoning
                        .or_else(|| payload.codex_options.and_then(|o| o.show_reasoning)),
                },
            },
            Err(_) => Self::new(input),
        }
    }
}

/// What the launcher needs to start one turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnInput {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Written to the process stdin, which then stays open for replies
    pub stdin: Option<String>,
    /// Side-channel file the session polls for telemetry
    pub telemetry_path: Option<PathBuf>,
}

impl TurnInput {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            telemetry_path: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_pair(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.into());
        self
    }
}
