// src/adapter/raw_text.rs
//! Gemini CLI / Qwen Code adapter (raw text with telemetry)
//!
//! Both CLIs print the reply as plain prose. Tool calls and token counts only
//! show up as telemetry objects, which the session extracts before lines reach
//! this adapter; what arrives here is prose, one line at a time.

use std::path::PathBuf;
use uuid::Uuid;

use super::*;
use crate::event::Event;

pub struct RawTextAdapter {
    backend: Backend,
    state: StreamState,
    turn_id: String,
    /// Blank lines seen since the last prose line
    pending_blank_lines: usize,
    telemetry_dir: PathBuf,
}

impl RawTextAdapter {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: StreamState::new(),
            turn_id: String::new(),
            pending_blank_lines: 0,
            telemetry_dir: std::env::temp_dir(),
        }
    }

    /// Directory for per-turn telemetry outfiles
    pub fn with_telemetry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.telemetry_dir = dir.into();
        self
    }

    fn message_id(&self) -> String {
        format!("{}:assistant", self.turn_id)
    }
}

impl StreamAdapter for RawTextAdapter {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn encode_turn(&mut self, request: &TurnRequest) -> TurnInput {
        let options = &request.options;
        let mut input = TurnInput::new(self.backend.program());
        input.cwd = options.cwd.clone();

        let mut prompt = request.prompt.clone();
        for image in &request.images {
            prompt.push_str(&format!(" @{}", image));
        }
        input = input.arg_pair("-p", prompt);
        if let Some(model) = &options.model {
            input = input.arg_pair("-m", model.clone());
        }

        let telemetry_path = self
            .telemetry_dir
            .join(format!("agent-stream-{}-{}.log", self.backend, Uuid::new_v4()));
        input = input
            .arg("--telemetry")
            .arg_pair("--telemetry-target", "local")
            .arg_pair("--telemetry-outfile", telemetry_path.display().to_string());
        input.telemetry_path = Some(telemetry_path);

        if options.approval_policy == Some(ApprovalPolicy::Never) {
            input = input.arg("--yolo");
        }
        if options.sandbox_mode == Some(SandboxMode::ReadOnly) {
            input = input.arg("--sandbox");
        }
        input
    }

    fn begin_turn(&mut self, turn_id: &str) {
        self.turn_id = turn_id.to_string();
        self.pending_blank_lines = 0;
        self.state.begin_turn();
    }

    fn ingest_line(&mut self, line: &str) -> Vec<Event> {
        if line.trim().is_empty() {
            // leading blanks are dropped, inner ones kept as paragraph breaks
            if self.state.accumulated().is_some() {
                self.pending_blank_lines += 1;
            }
            return Vec::new();
        }

        let chunk = match self.state.accumulated() {
            Some(_) => format!("{}{}", "\n".repeat(self.pending_blank_lines + 1), line),
            None => line.to_string(),
        };
        self.pending_blank_lines = 0;
        let id = self.message_id();
        let events = self.state.delta(&id, &chunk);
        self.state.track(events)
    }

    fn finish(&mut self, exit_code: Option<i32>) -> Vec<Event> {
        self.pending_blank_lines = 0;
        self.state.finish(exit_code)
    }

    fn interrupt(&mut self) -> Vec<Event> {
        self.pending_blank_lines = 0;
        self.state.interrupt()
    }

    fn session_id(&self) -> Option<&str> {
        None
    }

    fn reset(&mut self) {
        self.state.reset();
        self.pending_blank_lines = 0;
    }
}
