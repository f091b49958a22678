//! Stream pipeline - raw bytes to canonical events for one session
//!
//! bytes -> lines -> sanitizer -> telemetry extraction -> adapter, with every
//! `ToolStart` passed through the checkpoint trigger on the way out. The
//! stdout reader and the telemetry poller share one pipeline, and with it one
//! fingerprint set.

use anyhow::Result;
use serde_json::Value;
use std::path::PathBuf;
use tracing::debug;

use crate::adapter::{
    get_adapter, Backend, PermissionResolution, ProtocolFamily, StreamAdapter, TurnInput, TurnRequest,
};
use crate::checkpoint::CheckpointTrigger;
use crate::config::EngineConfig;
use crate::event::{Event, EventClock, PermissionScope};
use crate::infra::{classify, Extraction, LineBuffer, Sanitizer, TelemetryMapper, TelemetryScanner};

pub struct StreamPipeline {
    adapter: Box<dyn StreamAdapter>,
    sanitizer: Sanitizer,
    lines: LineBuffer,
    /// Telemetry interleaved into stdout
    stdout_scanner: TelemetryScanner,
    /// Telemetry from the side-channel file
    file_scanner: TelemetryScanner,
    mapper: TelemetryMapper,
    trigger: Option<CheckpointTrigger>,
    clock: EventClock,
    max_pending_bytes: usize,
}

impl StreamPipeline {
    pub fn new(backend: Backend, cwd: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        Self::with_adapter(get_adapter(backend), cwd, config)
    }

    pub fn with_adapter(adapter: Box<dyn StreamAdapter>, cwd: impl Into<PathBuf>, config: &EngineConfig) -> Self {
        let max_pending_bytes = config.telemetry.max_pending_bytes;
        let trigger = config
            .checkpoints
            .enabled
            .then(|| CheckpointTrigger::new(cwd).with_max_snapshot_bytes(config.checkpoints.max_snapshot_bytes));
        Self {
            sanitizer: Sanitizer::for_backend(adapter.backend()),
            adapter,
            lines: LineBuffer::new(),
            stdout_scanner: TelemetryScanner::new(max_pending_bytes),
            file_scanner: TelemetryScanner::new(max_pending_bytes),
            mapper: TelemetryMapper::new(),
            trigger,
            clock: EventClock::new(),
            max_pending_bytes,
        }
    }

    pub fn backend(&self) -> Backend {
        self.adapter.backend()
    }

    pub fn adapter(&self) -> &dyn StreamAdapter {
        self.adapter.as_ref()
    }

    /// Point file snapshots at a new working directory
    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        if let Some(trigger) = self.trigger.as_mut() {
            trigger.set_cwd(cwd);
        }
    }

    pub fn encode_turn(&mut self, request: &TurnRequest) -> TurnInput {
        if let Some(cwd) = &request.options.cwd {
            self.set_cwd(cwd.clone());
        }
        self.adapter.encode_turn(request)
    }

    /// Start a turn with empty framing buffers.
    pub fn begin_turn(&mut self, turn_id: &str) {
        self.discard_buffers();
        self.adapter.begin_turn(turn_id);
    }

    /// Feed a chunk of subprocess stdout.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        for line in self.lines.feed(chunk) {
            events.extend(self.ingest_line(&line));
        }
        events
    }

    /// Process one complete stdout line.
    pub fn ingest_line(&mut self, line: &str) -> Vec<Event> {
        let Some(cleaned) = self.sanitizer.clean_line(line) else {
            return Vec::new();
        };

        let events = match self.adapter.family() {
            ProtocolFamily::RawTextWithTelemetry => {
                let extraction = self.stdout_scanner.push(&format!("{}\n", cleaned));
                self.apply_extraction(extraction)
            }
            ProtocolFamily::StructuredLine | ProtocolFamily::ThreadEvent => self.adapter.ingest_line(&cleaned),
        };
        self.guard(events)
    }

    /// Feed text read from the side-channel telemetry file.
    pub fn ingest_telemetry(&mut self, text: &str) -> Vec<Event> {
        let extraction = self.file_scanner.push(text);
        let events = self.map_documents(extraction.documents());
        self.guard(events)
    }

    /// The subprocess exited; flush everything held back.
    pub fn finish(&mut self, exit_code: Option<i32>) -> Vec<Event> {
        let mut events = Vec::new();
        if let Some(rest) = self.lines.finish() {
            events.extend(self.ingest_line(&rest));
        }

        let tail = self.stdout_scanner.finish();
        let mut flushed = self.apply_extraction(tail);
        let file_tail = self.file_scanner.finish();
        flushed.extend(self.map_documents(file_tail.documents()));
        flushed.extend(self.adapter.finish(exit_code));
        events.extend(self.guard(flushed));
        events
    }

    /// Stop mid-turn: partial raw input is dropped, the partial message is flushed.
    pub fn interrupt(&mut self) -> Vec<Event> {
        self.discard_buffers();
        self.adapter.interrupt()
    }

    pub fn resolve_permission(
        &mut self,
        request_id: &str,
        allow: bool,
        scope: PermissionScope,
    ) -> Result<PermissionResolution> {
        self.adapter.resolve_permission(request_id, allow, scope)
    }

    /// Forget all parsing state, including the telemetry fingerprints.
    pub fn reset(&mut self) {
        self.discard_buffers();
        self.adapter.reset();
        self.mapper.clear();
    }

    fn discard_buffers(&mut self) {
        self.lines = LineBuffer::new();
        self.stdout_scanner = TelemetryScanner::new(self.max_pending_bytes);
        self.file_scanner = TelemetryScanner::new(self.max_pending_bytes);
    }

    fn apply_extraction(&mut self, extraction: Extraction) -> Vec<Event> {
        let mut events = self.map_documents(extraction.documents());
        let prose = extraction.compact_prose();
        if !prose.is_empty() {
            let prose = prose.strip_suffix('\n').unwrap_or(&prose);
            for line in prose.split('\n') {
                events.extend(self.adapter.ingest_line(line));
            }
        }
        events
    }

    fn map_documents<'a>(&mut self, documents: impl Iterator<Item = &'a Value>) -> Vec<Event> {
        let mut events = Vec::new();
        for doc in documents {
            events.extend(self.mapper.map(classify(doc), &mut self.clock));
        }
        events
    }

    /// Put a checkpoint in front of every tool start that needs one.
    fn guard(&mut self, events: Vec<Event>) -> Vec<Event> {
        let Some(trigger) = self.trigger.as_ref() else {
            return events;
        };
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            if let Some(checkpoint) = trigger.inspect(&event, event.timestamp()) {
                debug!(kind = event.kind(), "Checkpoint precedes tool start");
                out.push(checkpoint);
            }
            out.push(event);
        }
        out
    }
}
