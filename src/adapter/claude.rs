// src/adapter/claude.rs
//! Claude Code adapter (structured-line JSON)
//!
//! `claude -p --output-format stream-json --verbose` prints one JSON object per
//! line: `system` (init), `stream_event` (partial deltas), `assistant` (one
//! content block at a time), `user` (tool results) and a closing `result`.

use serde_json::Value;
use tracing::{debug, warn};

use super::*;
use crate::event::{Event, ToolKind};

pub struct ClaudeAdapter {
    state: StreamState,
    turn_id: String,
    session_id: Option<String>,
    /// Last raw line, for dropping consecutive repeats
    last_line: Option<String>,
    /// Message id announced by the latest `message_start`
    stream_message_id: Option<String>,
    last_assistant_id: Option<String>,
    thinking_seq: u32,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            state: StreamState::new(),
            turn_id: String::new(),
            session_id: None,
            last_line: None,
            stream_message_id: None,
            last_assistant_id: None,
            thinking_seq: 0,
        }
    }

    fn fallback_id(&self) -> String {
        format!("{}:assistant", self.turn_id)
    }

    fn current_message_id(&self) -> String {
        self.stream_message_id
            .clone()
            .or_else(|| self.last_assistant_id.clone())
            .unwrap_or_else(|| self.fallback_id())
    }

    fn thinking(&mut self, parent_id: &str, text: &str, done: bool) -> Event {
        self.thinking_seq += 1;
        Event::ThinkingUpdate {
            id: format!("{}::{}", parent_id, self.thinking_seq),
            parent_id: parent_id.to_string(),
            sequence: self.thinking_seq,
            text: text.to_string(),
            done,
            timestamp: self.state.clock.now(),
        }
    }

    fn on_system(&mut self, value: Value) -> Vec<Event> {
        if value.get("subtype").and_then(|v| v.as_str()) != Some("init") {
            return vec![Event::Raw {
                payload: value,
                timestamp: self.state.clock.now(),
            }];
        }
        if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
            debug!(session_id = %id, "Claude session initialised");
            self.session_id = Some(id.to_string());
        }
        let model = value
            .get("model")
            .and_then(|v| v.as_str())
            .map(String::from);
        vec![Event::ModelUpdate {
            model,
            timestamp: self.state.clock.now(),
        }]
    }

    fn on_stream_event(&mut self, value: &Value) -> Vec<Event> {
        let Some(event) = value.get("event") else {
            return Vec::new();
        };
        match event.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "message_start" => {
                self.stream_message_id = event
                    .pointer("/message/id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                self.thinking_seq = 0;
                Vec::new()
            }
            "content_block_delta" => {
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                let id = self.current_message_id();
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        let text = delta.get("text").and_then(|v| v.as_str()).unwrap_or("");
                        self.state.delta(&id, text)
                    }
                    "thinking_delta" => {
                        let text = delta.get("thinking").and_then(|v| v.as_str()).unwrap_or("");
                        vec![self.thinking(&id, text, false)]
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_assistant(&mut self, value: &Value) -> Vec<Event> {
        let message = value.get("message").cloned().unwrap_or(Value::Null);
        let id = message
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| self.current_message_id());
        self.last_assistant_id = Some(id.clone());

        let mut events = Vec::new();
        let blocks = message
            .get("content")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "text" => {
                    let text = block.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    events.extend(self.state.complete(&id, Some(text)));
                }
                "thinking" => {
                    // streamed already when partial messages are on
                    let text = if self.thinking_seq == 0 {
                        block.get("thinking").and_then(|v| v.as_str()).unwrap_or("")
                    } else {
                        ""
                    };
                    events.push(self.thinking(&id, text, true));
                }
                "tool_use" => {
                    events.extend(self.state.complete_current());
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let tool_id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    events.push(Event::ToolStart {
                        id: tool_id,
                        tool_kind: ToolKind::from_tool_name(&name),
                        name,
                        args: block.get("input").cloned().unwrap_or(Value::Null),
                        timestamp: self.state.clock.now(),
                    });
                }
                _ => {}
            }
        }
        events
    }

    fn on_user(&mut self, value: &Value) -> Vec<Event> {
        let blocks = value
            .pointer("/message/content")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        blocks
            .iter()
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("tool_result"))
            .map(|block| {
                let is_error = block.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
                Event::ToolOutput {
                    id: block
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    chunk: tool_result_text(block.get("content")),
                    done: true,
                    exit_code: is_error.then_some(1),
                    stream: None,
                    timestamp: self.state.clock.now(),
                }
            })
            .collect()
    }

    fn on_result(&mut self, value: &Value) -> Vec<Event> {
        let mut events = Vec::new();
        let subtype = value.get("subtype").and_then(|v| v.as_str()).unwrap_or("success");
        let is_error = value.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
        let result = value.get("result").and_then(|v| v.as_str());

        if subtype == "success" && !is_error {
            let id = self.current_message_id();
            events.extend(self.state.complete(&id, result));
        } else {
            events.extend(self.state.complete_current());
            let message = result
                .map(String::from)
                .or_else(|| {
                    value.get("errors").and_then(|v| v.as_array()).map(|errs| {
                        errs.iter()
                            .filter_map(|e| e.as_str())
                            .collect::<Vec<_>>()
                            .join("; ")
                    })
                })
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| subtype.to_string());
            events.push(Event::Error {
                message,
                exit_code: None,
                timestamp: self.state.clock.now(),
            });
        }

        if let Some(usage) = value.get("usage") {
            let field = |k: &str| usage.get(k).and_then(|v| v.as_u64()).unwrap_or(0);
            events.push(Event::TelemetryTokens {
                tokens_in: field("input_tokens"),
                tokens_out: field("output_tokens"),
                cached_tokens: field("cache_read_input_tokens"),
                latency_ms: value.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
                context: None,
                timestamp: self.state.clock.now(),
            });
        }
        if let Some(usd) = value.get("total_cost_usd").and_then(|v| v.as_f64()) {
            let field = |k: &str| {
                value
                    .get("usage")
                    .and_then(|u| u.get(k))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
            };
            events.push(Event::CostUpdate {
                usd,
                tokens_in: field("input_tokens"),
                tokens_out: field("output_tokens"),
                timestamp: self.state.clock.now(),
            });
        }

        self.stream_message_id = None;
        self.last_assistant_id = None;
        events
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tool results are either a string or an array of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl StreamAdapter for ClaudeAdapter {
    fn backend(&self) -> Backend {
        Backend::Claude
    }

    fn encode_turn(&mut self, request: &TurnRequest) -> TurnInput {
        let mut input = TurnInput::new(Backend::Claude.program());
        input.cwd = request.options.cwd.clone();
        if let Some(session_id) = &self.session_id {
            input = input.arg_pair("--resume", session_id.clone());
        }

        let mut prompt = request.prompt.clone();
        for image in &request.images {
            prompt.push_str(&format!("\n@{}", image));
        }
        input = input.arg_pair("-p", prompt);
        if let Some(model) = &request.options.model {
            input = input.arg_pair("--model", model.clone());
        }
        input = input
            .arg_pair("--output-format", "stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages");

        match (request.options.approval_policy, request.options.sandbox_mode) {
            (Some(ApprovalPolicy::Never), _) | (_, Some(SandboxMode::DangerFullAccess)) => {
                input = input.arg("--dangerously-skip-permissions");
            }
            (_, Some(SandboxMode::ReadOnly)) => {
                input = input.arg_pair("--permission-mode", "plan");
            }
            _ => {}
        }
        input
    }

    fn begin_turn(&mut self, turn_id: &str) {
        self.turn_id = turn_id.to_string();
        self.state.begin_turn();
        self.last_line = None;
        self.stream_message_id = None;
        self.last_assistant_id = None;
        self.thinking_seq = 0;
    }

    fn ingest_line(&mut self, line: &str) -> Vec<Event> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if self.last_line.as_deref() == Some(trimmed) {
            debug!("Dropping repeated Claude line");
            return Vec::new();
        }
        self.last_line = Some(trimmed.to_string());

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, line = %trimmed, "Skipping malformed Claude record");
                return Vec::new();
            }
        };

        let events = match value.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "system" => self.on_system(value),
            "stream_event" => self.on_stream_event(&value),
            "assistant" => self.on_assistant(&value),
            "user" => self.on_user(&value),
            "result" => self.on_result(&value),
            _ => vec![Event::Raw {
                payload: value,
                timestamp: self.state.clock.now(),
            }],
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
        self.session_id.as_deref()
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ToolKind;

    fn adapter() -> ClaudeAdapter {
        let mut adapter = ClaudeAdapter::new();
        adapter.begin_turn("t1");
        adapter
    }

    #[test]
    fn test_init_sets_model_and_session() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(
            r#"{"type":"system","subtype":"init","session_id":"abc-123","model":"claude-sonnet-4"}"#,
        );
        assert!(matches!(&events[0], Event::ModelUpdate { model: Some(m), .. } if m == "claude-sonnet-4"));
        assert_eq!(adapter.session_id(), Some("abc-123"));
    }

    #[test]
    fn test_partial_deltas_then_assistant_completion() {
        let mut adapter = adapter();
        adapter.ingest_line(r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"msg_1"}}}"#);
        let d1 = adapter.ingest_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}"#,
        );
        let d2 = adapter.ingest_line(
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}}"#,
        );
        assert!(matches!(&d1[0], Event::AssistantDelta { id, chunk, .. } if id == "msg_1" && chunk == "Hel"));
        assert_eq!(d2.len(), 1);

        let done = adapter.ingest_line(
            r#"{"type":"assistant","message":{"id":"msg_1","content":[{"type":"text","text":"Hello"}]}}"#,
        );
        assert!(matches!(&done[0], Event::AssistantComplete { id, text, .. } if id == "msg_1" && text == "Hello"));
    }

    #[test]
    fn test_tool_use_and_result() {
        let mut adapter = adapter();
        let start = adapter.ingest_line(
            r#"{"type":"assistant","message":{"id":"msg_2","content":[{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        assert!(matches!(&start[0], Event::ToolStart { id, tool_kind: ToolKind::Bash, .. } if id == "toolu_1"));

        let output = adapter.ingest_line(
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":[{"type":"text","text":"a.txt"}],"is_error":false}]}}"#,
        );
        assert!(matches!(&output[0], Event::ToolOutput { id, chunk, done: true, exit_code: None, .. } if id == "toolu_1" && chunk == "a.txt"));
    }

    #[test]
    fn test_result_emits_cost_and_tokens() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(
            r#"{"type":"result","subtype":"success","result":"All done","total_cost_usd":0.012,"duration_ms":4200,"usage":{"input_tokens":100,"output_tokens":20,"cache_read_input_tokens":80}}"#,
        );
        assert!(matches!(&events[0], Event::AssistantComplete { id, text, .. } if id == "t1:assistant" && text == "All done"));
        assert!(events.iter().any(|e| matches!(e, Event::TelemetryTokens { tokens_in: 100, cached_tokens: 80, latency_ms: 4200, .. })));
        assert!(events.iter().any(|e| matches!(e, Event::CostUpdate { tokens_out: 20, .. })));
    }

    #[test]
    fn test_error_result() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#);
        assert!(matches!(&events[0], Event::Error { message, .. } if message == "error_max_turns"));
    }

    #[test]
    fn test_repeated_and_malformed_lines_are_skipped() {
        let mut adapter = adapter();
        let line = r#"{"type":"assistant","message":{"id":"m","content":[{"type":"text","text":"Hi"}]}}"#;
        assert_eq!(adapter.ingest_line(line).len(), 1);
        assert!(adapter.ingest_line(line).is_empty());
        assert!(adapter.ingest_line(r#"{"type":"assis"#).is_empty());
    }

    #[test]
    fn test_unknown_record_passes_through_raw() {
        let mut adapter = adapter();
        let events = adapter.ingest_line(r#"{"type":"rate_limit","retry_after":3}"#);
        assert!(matches!(&events[0], Event::Raw { payload, .. } if payload["retry_after"] == 3));
    }

    #[test]
    fn test_encode_turn_resumes_session() {
        let mut adapter = adapter();
        let first = adapter.encode_turn(&TurnRequest::new("hi"));
        assert_eq!(first.program, "claude");
        assert!(!first.args.contains(&"--resume".to_string()));
        assert!(first.args.contains(&"stream-json".to_string()));

        adapter.ingest_line(r#"{"type":"system","subtype":"init","session_id":"s-1"}"#);
        let request = TurnRequest::new("again").with_options(TurnOptions {
            approval_policy: Some(ApprovalPolicy::Never),
            model: Some("opus".into()),
            ..Default::default()
        });
        let second = adapter.encode_turn(&request);
        assert_eq!(&second.args[..2], &["--resume".to_string(), "s-1".to_string()]);
        assert!(second.args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(second.args.windows(2).any(|w| w[0] == "--model" && w[1] == "opus"));
    }
}
