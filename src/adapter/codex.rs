// src/adapter/codex.rs
//! Codex CLI adapter (thread-event JSON)
//!
//! Understands both shapes Codex prints:
//! - `codex exec --json`: `thread.*` / `turn.*` / `item.*` lines, where an item
//!   is re-sent whole on every update
//! - the `{ "id": <submission>, "msg": { "type": ... } }` proto envelope, which
//!   streams deltas and raises approval requests answered on stdin

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::*;
use crate::event::{ContextUsage, Event, OutputStream, PermissionScope, ToolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissionKind {
    Exec,
    Patch,
}

#[derive(Debug, Clone)]
struct PendingPermission {
    submission_id: String,
    kind: PermissionKind,
}

#[derive(Debug, Default)]
struct ReasoningBuffer {
    sequence: u32,
    text: String,
}

pub struct CodexAdapter {
    state: StreamState,
    cwd: Option<PathBuf>,
    thread_id: Option<String>,
    model: Option<String>,
    /// Text already emitted per item id (items are re-sent whole)
    item_progress: HashMap<String, String>,
    started_items: HashSet<String>,
    reasoning: HashMap<String, ReasoningBuffer>,
    pending_permissions: HashMap<String, PendingPermission>,
    /// Proposed edit ids per patch call
    pending_edits: HashMap<String, Vec<String>>,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
            cwd: None,
            thread_id: None,
            model: None,
            item_progress: HashMap::new(),
            started_items: HashSet::new(),
            reasoning: HashMap::new(),
            pending_permissions: HashMap::new(),
            pending_edits: HashMap::new(),
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn now(&mut self) -> i64 {
        self.state.clock.now()
    }

    /// New suffix of an item's text since the last update.
    fn progress(&mut self, item_id: &str, text: &str) -> String {
        let previous = self.item_progress.entry(item_id.to_string()).or_default();
        let suffix = if text.starts_with(previous.as_str()) {
            text[previous.len()..].to_string()
        } else {
            debug!(item_id = %item_id, "Item text rewritten, not a continuation");
            String::new()
        };
        *previous = text.to_string();
        suffix
    }

    fn reasoning_chunk(&mut self, parent_id: &str, chunk: &str, done: bool) -> Vec<Event> {
        let buffer = self.reasoning.entry(parent_id.to_string()).or_default();
        buffer.sequence += 1;
        buffer.text.push_str(chunk);
        let sequence = buffer.sequence;
        if done {
            self.reasoning.remove(parent_id);
        }
        vec![Event::ThinkingUpdate {
            id: format!("{}::{}", parent_id, sequence),
            parent_id: parent_id.to_string(),
            sequence,
            text: chunk.to_string(),
            done,
            timestamp: self.now(),
        }]
    }

    fn tool_start(&mut self, id: &str, kind: ToolKind, name: &str, args: Value) -> Vec<Event> {
        if !self.started_items.insert(id.to_string()) {
            return Vec::new();
        }
        let mut events = self.state.complete_current();
        events.push(Event::ToolStart {
            id: id.to_string(),
            tool_kind: kind,
            name: name.to_string(),
            args,
            timestamp: self.now(),
        });
        events
    }

    fn tool_output(&mut self, id: &str, chunk: String, done: bool, exit_code: Option<i32>) -> Event {
        if done {
            self.started_items.remove(id);
            self.item_progress.remove(id);
        }
        Event::ToolOutput {
            id: id.to_string(),
            chunk,
            done,
            exit_code,
            stream: None,
            timestamp: self.now(),
        }
    }

    fn error(&mut self, message: impl Into<String>) -> Event {
        Event::Error {
            message: message.into(),
            exit_code: None,
            timestamp: self.now(),
        }
    }

    fn display_path(&self, path: &str) -> String {
        match &self.cwd {
            Some(cwd) => Path::new(path)
                .strip_prefix(cwd)
                .map(|rel| rel.display().to_string())
                .unwrap_or_else(|_| path.to_string()),
            None => path.to_string(),
        }
    }

    // ---- exec --json thread events ----

    fn on_thread_event(&mut self, event_type: &str, value: Value) -> Vec<Event> {
        match event_type {
            "thread.started" => {
                if let Some(id) = value.get("thread_id").and_then(|v| v.as_str()) {
                    debug!(thread_id = %id, "Codex thread started");
                    self.thread_id = Some(id.to_string());
                }
                Vec::new()
            }
            "turn.started" => Vec::new(),
            "turn.completed" => {
                let mut events = self.state.complete_current();
                if let Some(usage) = value.get("usage") {
                    let field = |k: &str| usage.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
                    let (tokens_in, cached, tokens_out) =
                        (field("input_tokens"), field("cached_input_tokens"), field("output_tokens"));
                    events.push(Event::TelemetryTokens {
                        tokens_in,
                        tokens_out,
                        cached_tokens: cached,
                        latency_ms: 0,
                        context: None,
                        timestamp: self.now(),
                    });
                }
                events
            }
            "turn.failed" => {
                let mut events = self.state.complete_current();
                let message = value
                    .pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Turn failed")
                    .to_string();
                events.push(self.error(message));
                events
            }
            "error" => {
                let message = value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown error")
                    .to_string();
                vec![self.error(message)]
            }
            "item.started" | "item.updated" | "item.completed" => {
                let completed = event_type == "item.completed";
                match value.get("item") {
                    Some(item) => self.on_item(item, completed),
                    None => Vec::new(),
                }
            }
            _ => vec![Event::Raw {
                payload: value,
                timestamp: self.now(),
            }],
        }
    }

    fn on_item(&mut self, item: &Value, completed: bool) -> Vec<Event> {
        let id = item.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let str_field = |k: &str| item.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let failed = item.get("status").and_then(|v| v.as_str()) == Some("failed");

        match item.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "agent_message" => {
                let text = str_field("text");
                if completed {
                    self.item_progress.remove(&id);
                    self.state.complete(&id, Some(&text))
                } else {
                    let suffix = self.progress(&id, &text);
                    self.state.delta(&id, &suffix)
                }
            }
            "reasoning" => {
                let text = str_field("text");
                let suffix = self.progress(&id, &text);
                if completed {
                    self.item_progress.remove(&id);
                    self.reasoning_chunk(&id, &suffix, true)
                } else if suffix.is_empty() {
                    Vec::new()
                } else {
                    self.reasoning_chunk(&id, &suffix, false)
                }
            }
            "command_execution" => {
                let command = str_field("command");
                let mut events =
                    self.tool_start(&id, ToolKind::Bash, "command_execution", json!({ "command": command }));
                let output = self.progress(&id, &str_field("aggregated_output"));
                if completed {
                    let exit_code = item
                        .get("exit_code")
                        .and_then(|v| v.as_i64())
                        .and_then(|c| i32::try_from(c).ok())
                        .or(failed.then_some(1));
                    events.push(self.tool_output(&id, output, true, exit_code));
                } else if !output.is_empty() {
                    events.push(self.tool_output(&id, output, false, None));
                }
                events
            }
            "file_change" => {
                let changes = item.get("changes").cloned().unwrap_or(Value::Array(Vec::new()));
                let mut events =
                    self.tool_start(&id, ToolKind::Write, "file_change", json!({ "changes": changes }));
                if completed {
                    let summary = changes
                        .as_array()
                        .map(|list| {
                            list.iter()
                                .map(|c| {
                                    let kind = c.get("kind").and_then(|v| v.as_str()).unwrap_or("update");
                                    let path = c.get("path").and_then(|v| v.as_str()).unwrap_or("");
                                    format!("{} {}", kind, self.display_path(path))
                                })
                                .collect::<Vec<_>>()
                                .join("\n")
                        })
                        .unwrap_or_default();
                    events.push(self.tool_output(&id, summary, true, Some(if failed { 1 } else { 0 })));
                }
                events
            }
            "mcp_tool_call" => {
                let name = format!("mcp__{}__{}", str_field("server"), str_field("tool"));
                let args = item.get("arguments").cloned().unwrap_or(Value::Null);
                let mut events = self.tool_start(&id, ToolKind::Mcp, &name, args);
                if completed {
                    let chunk = item
                        .pointer("/error/message")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .or_else(|| item.get("result").map(|r| r.to_string()))
                        .unwrap_or_default();
                    events.push(self.tool_output(&id, chunk, true, failed.then_some(1)));
                }
                events
            }
            "web_search" => {
                let mut events =
                    self.tool_start(&id, ToolKind::Web, "web_search", json!({ "query": str_field("query") }));
                if completed {
                    events.push(self.tool_output(&id, String::new(), true, None));
                }
                events
            }
            "todo_list" => {
                let items = item.get("items").cloned().unwrap_or(Value::Null);
                let mut events = self.tool_start(&id, ToolKind::Task, "todo_list", json!({ "items": items }));
                if completed {
                    events.push(self.tool_output(&id, String::new(), true, None));
                }
                events
            }
            "error" => vec![self.error(str_field("message"))],
            _ => vec![Event::Raw {
                payload: item.clone(),
                timestamp: self.now(),
            }],
        }
    }

    // ---- proto envelope ----

    fn on_proto(&mut self, submission_id: &str, msg: Value) -> Vec<Event> {
        let str_field = |k: &str| msg.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();
        match msg.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "session_configured" => {
                self.model = msg.get("model").and_then(|v| v.as_str()).map(String::from);
                if let Some(id) = msg.get("session_id").and_then(|v| v.as_str()) {
                    self.thread_id = Some(id.to_string());
                }
                vec![Event::ModelUpdate {
                    model: self.model.clone(),
                    timestamp: self.now(),
                }]
            }
            "task_started" => Vec::new(),
            "agent_message_delta" => self.state.delta(submission_id, &str_field("delta")),
            "agent_message" => self.state.complete(submission_id, Some(&str_field("message"))),
            "agent_reasoning_delta" | "agent_reasoning_raw_content_delta" => {
                self.reasoning_chunk(submission_id, &str_field("delta"), false)
            }
            "agent_reasoning" | "agent_reasoning_raw_content" => {
                self.reasoning_chunk(submission_id, &str_field("text"), true)
            }
            "agent_reasoning_section_break" => self.reasoning_chunk(submission_id, "\n\n", false),
            "exec_command_begin" => {
                let call_id = str_field("call_id");
                let args = json!({
                    "command": join_command(msg.get("command")),
                    "cwd": self.display_path(&str_field("cwd")),
                    "submissionId": submission_id,
                });
                self.tool_start(&call_id, ToolKind::Bash, "exec_command", args)
            }
            "exec_command_output_delta" => {
                let stream = match msg.get("stream").and_then(|v| v.as_str()) {
                    Some("stderr") => OutputStream::Stderr,
                    _ => OutputStream::Stdout,
                };
                vec![Event::ToolOutput {
                    id: str_field("call_id"),
                    chunk: decode_chunk(msg.get("chunk")),
                    done: false,
                    exit_code: None,
                    stream: Some(stream),
                    timestamp: self.now(),
                }]
            }
            "exec_command_end" => {
                let raw_code = msg.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(0);
                let chunk = ["formatted_output", "aggregated_output", "stdout", "stderr"]
                    .iter()
                    .map(|k| str_field(*k))
                    .find(|s| !s.is_empty())
                    .unwrap_or_else(|| format!("Command exited with code {}", raw_code));
                // out of range codes are reported as unknown rather than wrapped
                let exit_code = i32::try_from(raw_code).ok();
                vec![self.tool_output(&str_field("call_id"), chunk, true, exit_code)]
            }
            "exec_approval_request" => {
                let permission_id = format!("exec:{}:{}", submission_id, str_field("call_id"));
                self.pending_permissions.insert(
                    permission_id.clone(),
                    PendingPermission {
                        submission_id: submission_id.to_string(),
                        kind: PermissionKind::Exec,
                    },
                );
                let details = json!({
                    "command": join_command(msg.get("command")),
                    "cwd": self.display_path(&str_field("cwd")),
                    "reason": msg.get("reason").cloned().unwrap_or(Value::Null),
                });
                vec![Event::PermissionRequest {
                    id: permission_id,
                    tools: vec![ToolKind::Bash],
                    scope: PermissionScope::Session,
                    details,
                    timestamp: self.now(),
                }]
            }
            "apply_patch_approval_request" => self.on_patch_approval(submission_id, &msg),
            "patch_apply_begin" => {
                let args = json!({ "changes": msg.get("changes").cloned().unwrap_or(Value::Null) });
                self.tool_start(&str_field("call_id"), ToolKind::Write, "apply_patch", args)
            }
            "patch_apply_end" => {
                let call_id = str_field("call_id");
                let success = msg.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
                let chunk = if success { str_field("stdout") } else { str_field("stderr") };
                let mut events = vec![self.tool_output(&call_id, chunk, true, Some(if success { 0 } else { 1 }))];
                for edit_id in self.pending_edits.remove(&call_id).unwrap_or_default() {
                    events.push(Event::EditResolved {
                        id: edit_id,
                        applied: success,
                        timestamp: self.now(),
                    });
                }
                events
            }
            "token_count" => self.on_token_count(&msg),
            "error" => {
                let mut events = self.state.complete_current();
                events.extend(
                    self.state
                        .complete(submission_id, Some(&format!("⚠️ {}", str_field("message")))),
                );
                events
            }
            "task_complete" => match msg.get("last_agent_message").and_then(|v| v.as_str()) {
                Some(last) => self.state.complete(submission_id, Some(last)),
                None => self.state.complete_current(),
            },
            "turn_aborted" => self.state.interrupt(),
            _ => vec![Event::Raw {
                payload: json!({ "id": submission_id, "event": msg }),
                timestamp: self.now(),
            }],
        }
    }

    fn on_patch_approval(&mut self, submission_id: &str, msg: &Value) -> Vec<Event> {
        let call_id = msg.get("call_id").and_then(|v| v.as_str()).unwrap_or_default();
        let permission_id = format!("patch:{}:{}", submission_id, call_id);
        self.pending_permissions.insert(
            permission_id.clone(),
            PendingPermission {
                submission_id: submission_id.to_string(),
                kind: PermissionKind::Patch,
            },
        );

        let mut events = Vec::new();
        let mut edit_ids = Vec::new();
        let mut files = Vec::new();
        if let Some(changes) = msg.get("changes").and_then(|v| v.as_object()) {
            for (path, change) in changes {
                let file = self.display_path(path);
                let content = |kind: &str, key: &str| {
                    change
                        .get(kind)
                        .and_then(|c| c.get(key))
                        .and_then(|v| v.as_str())
                        .map(String::from)
                };
                let (before, after) = if let Some(added) = content("add", "content") {
                    (String::new(), added)
                } else if let Some(deleted) = content("delete", "content") {
                    (deleted, String::new())
                } else {
                    (String::new(), content("update", "unified_diff").unwrap_or_default())
                };
                let edit_id = format!("edit-{}", Uuid::new_v4());
                edit_ids.push(edit_id.clone());
                events.push(Event::EditProposed {
                    id: edit_id,
                    file: file.clone(),
                    before,
                    after,
                    timestamp: self.now(),
                });
                files.push(file);
            }
        }
        self.pending_edits.insert(call_id.to_string(), edit_ids);

        let grant_root = msg
            .get("grant_root")
            .and_then(|v| v.as_str())
            .map(|p| self.display_path(p));
        events.push(Event::PermissionRequest {
            id: permission_id,
            tools: vec![ToolKind::Write],
            scope: PermissionScope::Session,
            details: json!({
                "files": files,
                "reason": msg.get("reason").cloned().unwrap_or(Value::Null),
                "grantRoot": grant_root,
            }),
            timestamp: self.now(),
        });
        events
    }

    fn on_token_count(&mut self, msg: &Value) -> Vec<Event> {
        let Some(info) = msg.get("info").filter(|v| !v.is_null()) else {
            return Vec::new();
        };
        let usage = info.get("last_token_usage").cloned().unwrap_or(Value::Null);
        let field = |k: &str| usage.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
        let reasoning = field("reasoning_output_tokens");
        let context = info
            .get("model_context_window")
            .and_then(|v| v.as_u64())
            .and_then(|window| ContextUsage::compute(window, field("total_tokens").saturating_sub(reasoning)));
        vec![Event::TelemetryTokens {
            tokens_in: field("input_tokens") + field("cached_input_tokens"),
            tokens_out: field("output_tokens") + reasoning,
            cached_tokens: field("cached_input_tokens"),
            latency_ms: 0,
            context,
            timestamp: self.now(),
        }]
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Join an argv array into one shell-readable command line.
fn join_command(command: Option<&Value>) -> String {
    match command {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.as_str())
            .map(|p| {
                if p.is_empty() || p.chars().any(|c| c.is_whitespace() || "'\"$`\\|&;<>()".contains(c)) {
                    format!("'{}'", p.replace('\'', "'\\''"))
                } else {
                    p.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Output chunks arrive as a string or as a byte array.
fn decode_chunk(chunk: Option<&Value>) -> String {
    match chunk {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(bytes)) => {
            let bytes: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64())
                .filter_map(|b| u8::try_from(b).ok())
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        _ => String::new(),
    }
}

impl StreamAdapter for CodexAdapter {
    fn backend(&self) -> Backend {
        Backend::Codex
    }

    fn encode_turn(&mut self, request: &TurnRequest) -> TurnInput {
        let options = &request.options;
        self.cwd = options.cwd.clone();
        if options.model.is_some() {
            self.model = options.model.clone();
        }

        let mut input = TurnInput::new(Backend::Codex.program()).arg("exec").arg("--json");
        input.cwd = options.cwd.clone();
        if let Some(model) = &self.model {
            input = input.arg_pair("--model", model.clone());
        }
        if let Some(sandbox) = options.sandbox_mode {
            input = input.arg_pair("--sandbox", sandbox.as_str());
        }
        if let Some(policy) = options.approval_policy {
            input = input.arg_pair("-c", format!("approval_policy=\"{}\"", policy.as_str()));
        }
        if let Some(effort) = &options.effort {
            input = input.arg_pair("-c", format!("model_reasoning_effort=\"{}\"", effort));
        }
        if options.show_reasoning == Some(false) {
            input = input.arg_pair("-c", "model_reasoning_summary=\"none\"");
        }
        for image in &request.images {
            input = input.arg_pair("--image", image.clone());
        }
        if let Some(thread_id) = &self.thread_id {
            input = input.arg("resume").arg(thread_id.clone());
        }
        input.arg(request.prompt.clone())
    }

    fn begin_turn(&mut self, _turn_id: &str) {
        self.state.begin_turn();
        self.item_progress.clear();
        self.started_items.clear();
        self.reasoning.clear();
    }

    fn ingest_line(&mut self, line: &str) -> Vec<Event> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let mut value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, line = %trimmed, "Skipping malformed Codex record");
                return Vec::new();
            }
        };

        let events = if value.get("msg").is_some_and(|m| m.is_object()) {
            let submission_id = value
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let msg = value.get_mut("msg").map(Value::take).unwrap_or(Value::Null);
            self.on_proto(&submission_id, msg)
        } else {
            let event_type = value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.on_thread_event(&event_type, value)
        };
        self.state.track(events)
    }

    fn finish(&mut self, exit_code: Option<i32>) -> Vec<Event> {
        self.state.finish(exit_code)
    }

    fn interrupt(&mut self) -> Vec<Event> {
        self.state.interrupt()
    }

    fn session_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn resolve_permission(
        &mut self,
        request_id: &str,
        allow: bool,
        scope: PermissionScope,
    ) -> Result<PermissionResolution> {
        let pending = self
            .pending_permissions
            .remove(request_id)
            .ok_or_else(|| anyhow!("Unknown permission request: {}", request_id))?;

        let decision = match (allow, scope) {
            (false, _) => "denied",
            (true, PermissionScope::Session | PermissionScope::Project) => "approved_for_session",
            (true, PermissionScope::Once) => "approved",
        };
        let (reply_id, op_type) = match pending.kind {
            PermissionKind::Exec => (format!("approval-{}", Uuid::new_v4()), "exec_approval"),
            PermissionKind::Patch => (format!("patch-{}", Uuid::new_v4()), "patch_approval"),
        };
        let reply = json!({
            "id": reply_id,
            "op": { "type": op_type, "id": pending.submission_id, "decision": decision },
        });

        Ok(PermissionResolution {
            event: Event::PermissionDecision {
                id: request_id.to_string(),
                allow,
                scope,
                timestamp: self.now(),
            },
            reply: Some(reply.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> CodexAdapter {
        let mut adapter = CodexAdapter::new();
        adapter.begin_turn("t1");
        adapter
    }

    #[test]
    fn test_agent_message_updates_become_deltas() {
        let mut adapter = adapter();
        adapter.ingest_line(r#"{"type":"thread.started","thread_id":"th_1"}"#);
        assert_eq!(adapter.session_id(), Some("th_1"));

        let first = adapter.ingest_line(r#"{"type":"item.updated","item":{"id":"item_0","type":"agent_message","text":"Hel"}}"#);
        let second = adapter.ingest_line(r#"{"type":"item.updated","item":{"id":"item_0","type":"agent_message","text":"Hello"}}"#);
        assert!(matches!(&first[0], Event::AssistantDelta { chunk, .. } if chunk == "Hel"));
        assert!(matches!(&second[0], Event::AssistantDelta { chunk, .. } if chunk == "lo"));

        let done = adapter.ingest_line(r#"{"type":"item.completed","item":{"id":"item_0","type":"agent_message","text":"Hello!"}}"#);
        assert!(matches!(&done[0], Event::AssistantComplete { id, text, .. } if id == "item_0" && text == "Hello!"));
    }

    #[test]
    fn test_command_execution_lifecycle() {
        let mut adapter = adapter();
        let start = adapter.ingest_line(
            r#"{"type":"item.started","item":{"id":"item_1","type":"command_execution","command":"bash -lc ls","aggregated_output":"","status":"in_progress"}}"#,
        );
        assert!(matches!(&start[0], Event::ToolStart { id, tool_kind: ToolKind::Bash, .. } if id == "item_1"));

        let partial = adapter.ingest_line(
            r#"{"type":"item.updated","item":{"id":"item_1","type":"command_execution","command":"bash -lc ls","aggregated_output":"a.txt\n","status":"in_progress"}}"#,
        );
        assert!(matches!(&partial[0], Event::ToolOutput { chunk, done: false, .. } if chunk == "a.txt\n"));

        let end = adapter.ingest_line(
            r#"{"type":"item.completed","item":{"id":"item_1","type":"command_execution","command":"bash -lc ls","aggregated_output":"a.txt\nb.txt\n","exit_code":0,"status":"completed"}}"#,
        );
        assert_eq!(end.len(), 1);
        assert!(matches!(&end[0], Event::ToolOutput { chunk, done: true, exit_code: Some(0), .. } if chunk == "b.txt\n"));
    }

    #[test]
    fn test_completed_file_change_without_start() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(
            r#"{"type":"item.completed","item":{"id":"item_2","type":"file_change","changes":[{"path":"src/lib.rs","kind":"update"}],"status":"completed"}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::ToolStart { tool_kind: ToolKind::Write, args, .. } if args["changes"][0]["path"] == "src/lib.rs"));
        assert!(matches!(&events[1], Event::ToolOutput { chunk, done: true, .. } if chunk == "update src/lib.rs"));
    }

    #[test]
    fn test_turn_completed_usage() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(
            r#"{"type":"turn.completed","usage":{"input_tokens":900,"cached_input_tokens":600,"output_tokens":40}}"#,
        );
        assert!(matches!(&events[0], Event::TelemetryTokens { tokens_in: 900, cached_tokens: 600, tokens_out: 40, .. }));
    }

    #[test]
    fn test_turn_failed_is_error() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(r#"{"type":"turn.failed","error":{"message":"stream disconnected"}}"#);
        assert!(matches!(&events[0], Event::Error { message, .. } if message == "stream disconnected"));
    }

    #[test]
    fn test_proto_reasoning_sequence() {
        let mut adapter = adapter();
        let a = adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"agent_reasoning_delta","delta":"Think"}}"#);
        let b = adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"agent_reasoning_section_break"}}"#);
        let c = adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"agent_reasoning","text":"Done"}}"#);
        assert!(matches!(&a[0], Event::ThinkingUpdate { id, sequence: 1, done: false, .. } if id == "sub1::1"));
        assert!(matches!(&b[0], Event::ThinkingUpdate { text, sequence: 2, .. } if text == "\n\n"));
        assert!(matches!(&c[0], Event::ThinkingUpdate { sequence: 3, done: true, .. }));

        let next = adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"agent_reasoning_delta","delta":"Again"}}"#);
        assert!(matches!(&next[0], Event::ThinkingUpdate { sequence: 1, .. }));
    }

    #[test]
    fn test_proto_exec_end_prefers_formatted_output() {
        let mut adapter = adapter();
        adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"exec_command_begin","call_id":"c1","command":["bash","-lc","rm -rf build"],"cwd":"/p"}}"#);
        let end = adapter.ingest_line(
            r#"{"id":"sub1","msg":{"type":"exec_command_end","call_id":"c1","stdout":"raw","stderr":"","aggregated_output":"agg","formatted_output":"","exit_code":0}}"#,
        );
        assert!(matches!(&end[0], Event::ToolOutput { chunk, exit_code: Some(0), .. } if chunk == "agg"));

        adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"exec_command_begin","call_id":"c2","command":["true"],"cwd":"/p"}}"#);
        let empty = adapter.ingest_line(
            r#"{"id":"sub1","msg":{"type":"exec_command_end","call_id":"c2","stdout":"","stderr":"","aggregated_output":"","formatted_output":"","exit_code":3}}"#,
        );
        assert!(matches!(&empty[0], Event::ToolOutput { chunk, .. } if chunk == "Command exited with code 3"));
    }

    #[test]
    fn test_out_of_range_values_are_not_truncated() {
        let mut adapter = adapter();
        adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"exec_command_begin","call_id":"c1","command":["true"],"cwd":"/p"}}"#);
        let end = adapter.ingest_line(
            r#"{"id":"sub1","msg":{"type":"exec_command_end","call_id":"c1","stdout":"","stderr":"","aggregated_output":"","formatted_output":"","exit_code":4294967297}}"#,
        );
        assert!(matches!(&end[0], Event::ToolOutput { chunk, exit_code: None, .. } if chunk == "Command exited with code 4294967297"));

        let item = adapter.ingest_line(
            r#"{"type":"item.completed","item":{"id":"item_1","type":"command_execution","command":"ls","aggregated_output":"","exit_code":4294967296,"status":"failed"}}"#,
        );
        assert!(matches!(item.last(), Some(Event::ToolOutput { done: true, exit_code: Some(1), .. })));

        assert_eq!(decode_chunk(Some(&json!([104, 105, 360]))), "hi");
    }

    #[test]
    fn test_exec_begin_joins_command() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(
            r#"{"id":"sub1","msg":{"type":"exec_command_begin","call_id":"c1","command":["bash","-lc","rm -rf build"],"cwd":"/p"}}"#,
        );
        assert!(matches!(&events[0], Event::ToolStart { args, .. } if args["command"] == "bash -lc 'rm -rf build'"));
    }

    #[test]
    fn test_exec_permission_round_trip() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(
            r#"{"id":"sub1","msg":{"type":"exec_approval_request","call_id":"c9","command":["git","push"],"cwd":"/p","reason":"network"}}"#,
        );
        assert!(matches!(&events[0], Event::PermissionRequest { id, tools, .. } if id == "exec:sub1:c9" && tools == &vec![ToolKind::Bash]));

        let resolution = adapter
            .resolve_permission("exec:sub1:c9", true, PermissionScope::Project)
            .unwrap();
        assert!(matches!(resolution.event, Event::PermissionDecision { allow: true, .. }));
        let reply: Value = serde_json::from_str(resolution.reply.as_deref().unwrap()).unwrap();
        assert_eq!(reply["op"]["type"], "exec_approval");
        assert_eq!(reply["op"]["id"], "sub1");
        assert_eq!(reply["op"]["decision"], "approved_for_session");

        assert!(adapter.resolve_permission("exec:sub1:c9", true, PermissionScope::Once).is_err());
    }

    #[test]
    fn test_patch_flow_resolves_proposed_edits() {
        let mut adapter = adapter();
        let request = adapter.ingest_line(
            r#"{"id":"sub2","msg":{"type":"apply_patch_approval_request","call_id":"p1","changes":{"a.txt":{"add":{"content":"hi\n"}},"b.txt":{"delete":{"content":"bye\n"}}}}}"#,
        );
        let proposed: Vec<_> = request
            .iter()
            .filter(|e| matches!(e, Event::EditProposed { .. }))
            .collect();
        assert_eq!(proposed.len(), 2);
        assert!(matches!(request.last(), Some(Event::PermissionRequest { id, .. }) if id == "patch:sub2:p1"));

        let denied = adapter.resolve_permission("patch:sub2:p1", false, PermissionScope::Once).unwrap();
        let reply: Value = serde_json::from_str(denied.reply.as_deref().unwrap()).unwrap();
        assert_eq!(reply["op"]["decision"], "denied");

        adapter.ingest_line(r#"{"id":"sub2","msg":{"type":"patch_apply_begin","call_id":"p1","changes":{"a.txt":{"add":{"content":"hi\n"}}}}}"#);
        let end = adapter.ingest_line(r#"{"id":"sub2","msg":{"type":"patch_apply_end","call_id":"p1","stdout":"","stderr":"rejected","success":false}}"#);
        assert!(matches!(&end[0], Event::ToolOutput { exit_code: Some(1), .. }));
        assert_eq!(end.iter().filter(|e| matches!(e, Event::EditResolved { applied: false, .. })).count(), 2);
    }

    #[test]
    fn test_token_count_context_usage() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(
            r#"{"id":"sub1","msg":{"type":"token_count","info":{"last_token_usage":{"input_tokens":20000,"cached_input_tokens":1000,"output_tokens":500,"reasoning_output_tokens":100,"total_tokens":22000},"model_context_window":112000}}}"#,
        );
        match &events[0] {
            Event::TelemetryTokens { tokens_in, tokens_out, context: Some(context), .. } => {
                assert_eq!(*tokens_in, 21000);
                assert_eq!(*tokens_out, 600);
                assert_eq!(context.context_effective, 100_000);
                assert_eq!(context.context_used_tokens, 9_900);
            }
            other => panic!("Expected TelemetryTokens, got {:?}", other),
        }
    }

    #[test]
    fn test_proto_error_and_task_complete() {
        let mut adapter = adapter();
        adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"agent_message_delta","delta":"Work"}}"#);
        let error = adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"error","message":"quota"}}"#);
        assert!(matches!(&error[0], Event::AssistantComplete { text, .. } if text == "Work"));
        assert!(matches!(&error[1], Event::AssistantComplete { text, .. } if text == "⚠️ quota"));

        let done = adapter.ingest_line(r#"{"id":"sub3","msg":{"type":"task_complete","last_agent_message":"Finished"}}"#);
        assert!(matches!(&done[0], Event::AssistantComplete { id, text, .. } if id == "sub3" && text == "Finished"));
    }

    #[test]
    fn test_unknown_proto_event_is_raw() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(r#"{"id":"sub1","msg":{"type":"mcp_list_tools_response","tools":{}}}"#);
        assert!(matches!(&events[0], Event::Raw { payload, .. } if payload["id"] == "sub1"));
    }

    #[test]
    fn test_encode_turn_resumes_thread() {
        let mut adapter = adapter();
        adapter.ingest_line(r#"{"type":"thread.started","thread_id":"th_9"}"#);
        let request = TurnRequest::new("continue").with_options(TurnOptions {
            sandbox_mode: Some(SandboxMode::WorkspaceWrite),
            approval_policy: Some(ApprovalPolicy::OnFailure),
            ..Default::default()
        });
        let input = adapter.encode_turn(&request);
        assert_eq!(input.program, "codex");
        assert_eq!(&input.args[..2], &["exec".to_string(), "--json".to_string()]);
        assert!(input.args.windows(2).any(|w| w[0] == "--sandbox" && w[1] == "workspace-write"));
        assert!(input.args.windows(2).any(|w| w[0] == "resume" && w[1] == "th_9"));
        assert_eq!(input.args.last().map(String::as_str), Some("continue"));
    }
}
