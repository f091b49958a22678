//! Canonical event model - the backend-agnostic shape every adapter emits
//!
//! Events serialize as internally tagged objects (`"type": "assistant:delta"`)
//! with camelCase fields so a renderer or persister can consume them without
//! knowing which agent produced them.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Closed tool vocabulary every backend tool name is folded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Bash,
    Read,
    Write,
    Grep,
    Web,
    Mcp,
    Task,
}

impl ToolKind {
    /// Fold a backend tool name into the closed vocabulary.
    ///
    /// Order matters: MCP-prefixed names often contain verbs like `create`,
    /// and todo tools contain `write`.
    pub fn from_tool_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if lower.starts_with("mcp__") || lower.starts_with("mcp_") || lower.starts_with("mcp:") {
            ToolKind::Mcp
        } else if has(&["bash", "command", "shell", "exec", "terminal"]) {
            ToolKind::Bash
        } else if has(&["todo", "task", "agent"]) {
            ToolKind::Task
        } else if has(&["web", "fetch", "url", "http", "browse"]) {
            ToolKind::Web
        } else if has(&["grep", "search", "glob", "find"]) {
            ToolKind::Grep
        } else if has(&[
            "write", "edit", "replace", "patch", "create", "delete", "move", "rename",
        ]) {
            ToolKind::Write
        } else if has(&["read", "view", "open", "list"]) || lower == "ls" || lower == "cat" {
            ToolKind::Read
        } else {
            ToolKind::Mcp
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Bash => "bash",
            ToolKind::Read => "read",
            ToolKind::Write => "write",
            ToolKind::Grep => "grep",
            ToolKind::Web => "web",
            ToolKind::Mcp => "mcp",
            ToolKind::Task => "task",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a permission grant reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    Once,
    Session,
    Project,
}

impl PermissionScope {
    pub fn parse(value: &str) -> Self {
        match value {
            "session" => PermissionScope::Session,
            "project" => PermissionScope::Project,
            _ => PermissionScope::Once,
        }
    }
}

/// Which stream a tool output chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Structured part of a message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { path: String },
}

/// Token counters attached to a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cached: u64,
}

/// Pre-mutation content of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    pub path: String,
    pub original_content: String,
}

/// Context-window accounting derived from a token report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub context_window: u64,
    pub context_effective: u64,
    pub context_used_tokens: u64,
    pub context_remaining_tokens: u64,
    pub context_used_pct: f64,
}

impl ContextUsage {
    /// Tokens every conversation spends on system prompt and tool schemas.
    pub const BASELINE_TOKENS: u64 = 12_000;

    /// Compute usage of `context_window` given the total tokens in context.
    ///
    /// Returns `None` when the window is not larger than the baseline.
    pub fn compute(context_window: u64, tokens_in_context: u64) -> Option<Self> {
        if context_window <= Self::BASELINE_TOKENS {
            return None;
        }
        let effective = context_window - Self::BASELINE_TOKENS;
        let used = tokens_in_context
            .saturating_sub(Self::BASELINE_TOKENS)
            .min(effective);
        let remaining = effective - used;
        let remaining_pct = remaining as f64 / effective as f64 * 100.0;
        Some(Self {
            context_window,
            context_effective: effective,
            context_used_tokens: used,
            context_remaining_tokens: remaining,
            context_used_pct: 100.0 - remaining_pct,
        })
    }
}

/// Canonical engine event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Event {
    #[serde(rename = "message")]
    Message {
        id: String,
        role: Role,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        content_parts: Vec<ContentPart>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenCounts>,
        timestamp: Timestamp,
    },
    #[serde(rename = "assistant:delta")]
    AssistantDelta {
        id: String,
        chunk: String,
        timestamp: Timestamp,
    },
    #[serde(rename = "assistant:complete")]
    AssistantComplete {
        id: String,
        text: String,
        #[serde(default)]
        interrupted: bool,
        timestamp: Timestamp,
    },
    #[serde(rename = "tool:start")]
    ToolStart {
        id: String,
        tool_kind: ToolKind,
        name: String,
        args: serde_json::Value,
        timestamp: Timestamp,
    },
    #[serde(rename = "tool:output")]
    ToolOutput {
        id: String,
        chunk: String,
        done: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream: Option<OutputStream>,
        timestamp: Timestamp,
    },
    #[serde(rename = "thinking")]
    ThinkingUpdate {
        id: String,
        parent_id: String,
        sequence: u32,
        text: String,
        done: bool,
        timestamp: Timestamp,
    },
    #[serde(rename = "permission:request")]
    PermissionRequest {
        id: String,
        tools: Vec<ToolKind>,
        scope: PermissionScope,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        details: serde_json::Value,
        timestamp: Timestamp,
    },
    #[serde(rename = "permission:decision")]
    PermissionDecision {
        id: String,
        allow: bool,
        scope: PermissionScope,
        timestamp: Timestamp,
    },
    #[serde(rename = "checkpoint:create")]
    CheckpointCreate {
        id: String,
        trigger: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        file_snapshots: Vec<FileSnapshot>,
        timestamp: Timestamp,
    },
    #[serde(rename = "edit:proposed")]
    EditProposed {
        id: String,
        file: String,
        before: String,
        after: String,
        timestamp: Timestamp,
    },
    #[serde(rename = "edit:resolved")]
    EditResolved {
        id: String,
        applied: bool,
        timestamp: Timestamp,
    },
    #[serde(rename = "cost:update")]
    CostUpdate {
        usd: f64,
        tokens_in: u64,
        tokens_out: u64,
        timestamp: Timestamp,
    },
    #[serde(rename = "telemetry:tokens")]
    TelemetryTokens {
        tokens_in: u64,
        tokens_out: u64,
        cached_tokens: u64,
        latency_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ContextUsage>,
        timestamp: Timestamp,
    },
    #[serde(rename = "model:update")]
    ModelUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        timestamp: Timestamp,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        timestamp: Timestamp,
    },
    #[serde(rename = "raw")]
    Raw {
        payload: serde_json::Value,
        timestamp: Timestamp,
    },
}

impl Event {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Event::Message { timestamp, .. }
            | Event::AssistantDelta { timestamp, .. }
            | Event::AssistantComplete { timestamp, .. }
            | Event::ToolStart { timestamp, .. }
            | Event::ToolOutput { timestamp, .. }
            | Event::ThinkingUpdate { timestamp, .. }
            | Event::PermissionRequest { timestamp, .. }
            | Event::PermissionDecision { timestamp, .. }
            | Event::CheckpointCreate { timestamp, .. }
            | Event::EditProposed { timestamp, .. }
            | Event::EditResolved { timestamp, .. }
            | Event::CostUpdate { timestamp, .. }
            | Event::TelemetryTokens { timestamp, .. }
            | Event::ModelUpdate { timestamp, .. }
            | Event::Error { timestamp, .. }
            | Event::Raw { timestamp, .. } => *timestamp,
        }
    }

    pub(crate) fn timestamp_mut(&mut self) -> &mut Timestamp {
        match self {
            Event::Message { timestamp, .. }
            | Event::AssistantDelta { timestamp, .. }
            | Event::AssistantComplete { timestamp, .. }
            | Event::ToolStart { timestamp, .. }
            | Event::ToolOutput { timestamp, .. }
            | Event::ThinkingUpdate { timestamp, .. }
            | Event::PermissionRequest { timestamp, .. }
            | Event::PermissionDecision { timestamp, .. }
            | Event::CheckpointCreate { timestamp, .. }
            | Event::EditProposed { timestamp, .. }
            | Event::EditResolved { timestamp, .. }
            | Event::CostUpdate { timestamp, .. }
            | Event::TelemetryTokens { timestamp, .. }
            | Event::ModelUpdate { timestamp, .. }
            | Event::Error { timestamp, .. }
            | Event::Raw { timestamp, .. } => timestamp,
        }
    }

    /// Wire name of the variant, as used in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Message { .. } => "message",
            Event::AssistantDelta { .. } => "assistant:delta",
            Event::AssistantComplete { .. } => "assistant:complete",
            Event::ToolStart { .. } => "tool:start",
            Event::ToolOutput { .. } => "tool:output",
            Event::ThinkingUpdate { .. } => "thinking",
            Event::PermissionRequest { .. } => "permission:request",
            Event::PermissionDecision { .. } => "permission:decision",
            Event::CheckpointCreate { .. } => "checkpoint:create",
            Event::EditProposed { .. } => "edit:proposed",
            Event::EditResolved { .. } => "edit:resolved",
            Event::CostUpdate { .. } => "cost:update",
            Event::TelemetryTokens { .. } => "telemetry:tokens",
            Event::ModelUpdate { .. } => "model:update",
            Event::Error { .. } => "error",
            Event::Raw { .. } => "raw",
        }
    }

    /// A user-authored message with plain text
    pub fn user_message(id: impl Into<String>, text: impl Into<String>, timestamp: Timestamp) -> Self {
        Event::Message {
            id: id.into(),
            role: Role::User,
            text: text.into(),
            content_parts: Vec::new(),
            model: None,
            tokens: None,
            timestamp,
        }
    }
}

/// Per-producer clock that never runs backwards.
///
/// Wall-clock adjustments must not reorder a tool's output before its start,
/// so every reading is clamped to the previous one.
#[derive(Debug, Default, Clone)]
pub struct EventClock {
    last: Timestamp,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> Timestamp {
        let now = Utc::now().timestamp_millis();
        self.last = self.last.max(now);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_kind_mapping() {
        assert_eq!(ToolKind::from_tool_name("Bash"), ToolKind::Bash);
        assert_eq!(ToolKind::from_tool_name("run_shell_command"), ToolKind::Bash);
        assert_eq!(ToolKind::from_tool_name("exec_command"), ToolKind::Bash);
        assert_eq!(ToolKind::from_tool_name("Read"), ToolKind::Read);
        assert_eq!(ToolKind::from_tool_name("read_many_files"), ToolKind::Read);
        assert_eq!(ToolKind::from_tool_name("list_directory"), ToolKind::Read);
        assert_eq!(ToolKind::from_tool_name("Write"), ToolKind::Write);
        assert_eq!(ToolKind::from_tool_name("Edit"), ToolKind::Write);
        assert_eq!(ToolKind::from_tool_name("replace"), ToolKind::Write);
        assert_eq!(ToolKind::from_tool_name("apply_patch"), ToolKind::Write);
        assert_eq!(ToolKind::from_tool_name("Grep"), ToolKind::Grep);
        assert_eq!(ToolKind::from_tool_name("search_file_content"), ToolKind::Grep);
        assert_eq!(ToolKind::from_tool_name("WebFetch"), ToolKind::Web);
        assert_eq!(ToolKind::from_tool_name("google_web_search"), ToolKind::Web);
        assert_eq!(ToolKind::from_tool_name("Task"), ToolKind::Task);
        assert_eq!(ToolKind::from_tool_name("TodoWrite"), ToolKind::Task);
        assert_eq!(ToolKind::from_tool_name("mcp__github__create_issue"), ToolKind::Mcp);
        assert_eq!(ToolKind::from_tool_name("something_else"), ToolKind::Mcp);
    }

    #[test]
    fn test_event_serializes_with_wire_tag() {
        let event = Event::AssistantDelta {
            id: "m1".into(),
            chunk: "Hel".into(),
            timestamp: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "assistant:delta");
        assert_eq!(json["chunk"], "Hel");

        let tool = Event::ToolOutput {
            id: "t1".into(),
            chunk: "ok".into(),
            done: true,
            exit_code: Some(0),
            stream: None,
            timestamp: 8,
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["type"], "tool:output");
        assert_eq!(json["exitCode"], 0);
        assert!(json.get("stream").is_none());
    }

    #[test]
    fn test_event_deserializes_from_wire() {
        let raw = r#"{"type":"tool:start","id":"t1","toolKind":"bash","name":"Bash","args":{"command":"ls"},"timestamp":1}"#;
        let event: Event = serde_json::from_str(raw).unwrap();
        match event {
            Event::ToolStart { tool_kind, args, .. } => {
                assert_eq!(tool_kind, ToolKind::Bash);
                assert_eq!(args["command"], "ls");
            }
            other => panic!("Expected ToolStart, got {:?}", other),
        }
    }

    #[test]
    fn test_context_usage() {
        let usage = ContextUsage::compute(200_000, 62_000).unwrap();
        assert_eq!(usage.context_effective, 188_000);
        assert_eq!(usage.context_used_tokens, 50_000);
        assert_eq!(usage.context_remaining_tokens, 138_000);
        assert!(usage.context_used_pct > 26.0 && usage.context_used_pct < 27.0);

        assert!(ContextUsage::compute(10_000, 5_000).is_none());
    }

    #[test]
    fn test_clock_is_monotonic() {
        let mut clock = EventClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
