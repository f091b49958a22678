// src/adapter/mod.rs
//! Per-agent stream adapters
//!
//! One adapter per protocol family turns complete output records into
//! canonical events. Adapters own all their parsing state, so one instance
//! serves exactly one session.

mod stream;
mod types;

pub use stream::StreamState;
pub use types::*;

use anyhow::{anyhow, Result};

use crate::event::{Event, PermissionScope};

/// Outcome of resolving a raised permission request
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionResolution {
    /// `PermissionDecision` to append to the log
    pub event: Event,
    /// Line to write to the agent's stdin, for protocols that take replies
    pub reply: Option<String>,
}

/// Agent stream adapter trait
pub trait StreamAdapter: Send {
    fn backend(&self) -> Backend;

    fn family(&self) -> ProtocolFamily {
        self.backend().family()
    }

    /// Build the process invocation for one turn.
    fn encode_turn(&mut self, request: &TurnRequest) -> TurnInput;

    /// Called once before the first record of a turn.
    fn begin_turn(&mut self, turn_id: &str);

    /// Translate one complete, sanitized record.
    fn ingest_line(&mut self, line: &str) -> Vec<Event>;

    /// The subprocess stream ended.
    fn finish(&mut self, exit_code: Option<i32>) -> Vec<Event>;

    /// Flush partial state after an interrupt.
    fn interrupt(&mut self) -> Vec<Event>;

    /// Backend session/thread id, once the backend reported one
    fn session_id(&self) -> Option<&str>;

    /// Forget all per-session parsing state.
    fn reset(&mut self);

    /// Answer a permission request this adapter raised.
    fn resolve_permission(
        &mut self,
        request_id: &str,
        _allow: bool,
        _scope: PermissionScope,
    ) -> Result<PermissionResolution> {
        Err(anyhow!("Unknown permission request: {}", request_id))
    }
}

/// Build the adapter for a backend
pub fn get_adapter(backend: Backend) -> Box<dyn StreamAdapter> {
    match backend {
        Backend::Claude => Box::new(claude::ClaudeAdapter::new()),
        Backend::Codex => Box::new(codex::CodexAdapter::new()),
        Backend::Gemini | Backend::Qwen => Box::new(raw_text::RawTextAdapter::new(backend)),
    }
}

pub mod claude;
pub mod codex;
pub mod raw_text;
