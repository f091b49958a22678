//! Telemetry extraction - pulls structured diagnostic JSON out of prose
//!
//! Some agents interleave pretty-printed telemetry objects into their plain
//! text output (and write the same objects back-to-back, without separators,
//! into a side-channel file). A block starts on a line whose first
//! non-whitespace character is `{` and that either stands alone or names a
//! known telemetry field; braces are then counted (string-aware) until the
//! object closes. Balanced blocks that mention a known field are cut out of
//! the prose. A block that does not parse is still cut, but yields nothing.

use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use crate::event::{ContextUsage, Event, EventClock, ToolKind};

/// Field names that mark an object as telemetry rather than quoted JSON in a reply
const KNOWN_FIELDS: &[&str] = &[
    "\"event.name\"",
    "\"function_name\"",
    "\"function_args\"",
    "\"input_token_count\"",
    "\"output_token_count\"",
    "\"cached_content_token_count\"",
    "\"tokensIn\"",
    "\"tokensOut\"",
    "\"input_tokens\"",
    "\"output_tokens\"",
    "\"tool_name\"",
];

/// One block cut out of the prose
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedBlock {
    /// Byte offset in the resulting prose where the block used to sit
    pub offset: usize,
    /// The block text exactly as it appeared
    pub source: String,
    /// Parsed document, `None` when the block was malformed
    pub document: Option<Value>,
}

/// Result of splitting text into prose and telemetry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub prose: String,
    pub blocks: Vec<ExtractedBlock>,
}

impl Extraction {
    /// Parsed documents, skipping malformed blocks.
    pub fn documents(&self) -> impl Iterator<Item = &Value> {
        self.blocks.iter().filter_map(|b| b.document.as_ref())
    }

    /// Prose with the lines that only held a block removed, so cutting a
    /// block out does not leave an empty line behind.
    pub fn compact_prose(&self) -> String {
        let prose = self.prose.as_str();
        let mut out = String::with_capacity(prose.len());
        let mut copied = 0;
        for block in &self.blocks {
            let offset = block.offset.min(prose.len());
            if offset < copied {
                continue;
            }
            let line_start = prose[..offset].rfind('\n').map(|p| p + 1).unwrap_or(0).max(copied);
            if prose[line_start..offset].trim().is_empty() && prose[offset..].starts_with('\n') {
                out.push_str(&prose[copied..line_start]);
                copied = offset + 1;
            }
        }
        out.push_str(&prose[copied..]);
        out
    }
}

/// Split `text` into prose and telemetry documents.
///
/// An unterminated block at the end of the text is left in the prose.
pub fn extract(text: &str) -> Extraction {
    scan(text).0
}

/// Put extracted blocks back at their offsets.
pub fn reinsert(prose: &str, blocks: &[ExtractedBlock]) -> String {
    let mut out = String::with_capacity(prose.len() + blocks.iter().map(|b| b.source.len()).sum::<usize>());
    let mut copied = 0;
    for block in blocks {
        let offset = block.offset.min(prose.len());
        out.push_str(&prose[copied..offset]);
        out.push_str(&block.source);
        copied = offset;
    }
    out.push_str(&prose[copied..]);
    out
}

/// Scan text; also report where an unterminated candidate block begins.
fn scan(text: &str) -> (Extraction, Option<usize>) {
    let bytes = text.as_bytes();
    let mut extraction = Extraction::default();
    let mut copied = 0;
    let mut incomplete = None;
    let mut at_line_start = true;
    let mut after_block = false;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\n' {
            at_line_start = true;
            after_block = false;
            i += 1;
            continue;
        }
        if b == b' ' || b == b'\t' {
            i += 1;
            continue;
        }

        if b == b'{' && (at_line_start || after_block) && opens_block(text, i, after_block) {
            match find_block_end(bytes, i) {
                Some(end) => {
                    let candidate = &text[i..end];
                    if mentions_known_field(candidate) {
                        extraction.prose.push_str(&text[copied..i]);
                        let document = match serde_json::from_str::<Value>(candidate) {
                            Ok(doc) => Some(doc),
                            Err(err) => {
                                debug!(error = %err, len = candidate.len(), "Dropping malformed telemetry block");
                                None
                            }
                        };
                        extraction.blocks.push(ExtractedBlock {
                            offset: extraction.prose.len(),
                            source: candidate.to_string(),
                            document,
                        });
                        copied = end;
                        i = end;
                        at_line_start = false;
                        after_block = true;
                        continue;
                    }
                }
                None => {
                    incomplete = Some(i);
                    break;
                }
            }
        }

        at_line_start = false;
        after_block = false;
        i += 1;
    }

    match incomplete {
        Some(start) => extraction.prose.push_str(&text[copied..start]),
        None => extraction.prose.push_str(&text[copied..]),
    }
    (extraction, incomplete)
}

/// Block-start heuristic: a bare `{` line, a `{` line naming a known field,
/// or an object that directly follows another extracted block.
fn opens_block(text: &str, start: usize, after_block: bool) -> bool {
    if after_block {
        return true;
    }
    let line_end = text[start..].find('\n').map(|p| start + p).unwrap_or(text.len());
    let line = text[start..line_end].trim_end();
    line == "{" || mentions_known_field(line)
}

fn mentions_known_field(text: &str) -> bool {
    KNOWN_FIELDS.iter().any(|field| text.contains(field))
}

/// Index one past the brace that balances the one at `start`.
fn find_block_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Incremental extractor that holds back an unterminated block until it closes
#[derive(Debug)]
pub struct TelemetryScanner {
    pending: String,
    max_pending_bytes: usize,
}

impl TelemetryScanner {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            pending: String::new(),
            max_pending_bytes,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Extraction {
        self.pending.push_str(chunk);
        let (extraction, incomplete) = scan(&self.pending);
        match incomplete {
            Some(start) if self.pending.len() - start <= self.max_pending_bytes => {
                self.pending.drain(..start);
                extraction
            }
            Some(start) => {
                // never closed; give it back as prose rather than grow forever
                debug!(len = self.pending.len() - start, "Releasing oversized unterminated block as prose");
                let mut extraction = extraction;
                extraction.prose.push_str(&self.pending[start..]);
                self.pending.clear();
                extraction
            }
            None => {
                self.pending.clear();
                extraction
            }
        }
    }

    /// Flush a held-back tail at end of stream.
    pub fn finish(&mut self) -> Extraction {
        let rest = std::mem::take(&mut self.pending);
        extract(&rest)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Token and latency counters reported by one telemetry document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenSample {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cached_tokens: u64,
    pub latency_ms: u64,
    pub cost_usd: Option<f64>,
    pub model: Option<String>,
    pub context_window: Option<u64>,
    /// Emission time stamped by the backend, when present
    pub recorded_at: Option<String>,
}

impl TokenSample {
    /// Dedup key: emission time plus every counter.
    pub fn fingerprint(&self) -> String {
        format!(
            "tokens\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.recorded_at.as_deref().unwrap_or_default(),
            self.model.as_deref().unwrap_or_default(),
            self.tokens_in,
            self.tokens_out,
            self.cached_tokens,
            self.latency_ms,
        )
    }
}

/// A tool invocation described by telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallDescriptor {
    pub name: String,
    pub args: Value,
    pub output: Option<String>,
    pub success: Option<bool>,
}

impl ToolCallDescriptor {
    /// Dedup key: name plus canonical (key-sorted) arguments.
    pub fn fingerprint(&self) -> String {
        format!("{}\u{1f}{}", self.name, self.args)
    }
}

/// Recognized telemetry document shapes
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Tokens(TokenSample),
    ToolCall(ToolCallDescriptor),
    Unrecognized,
}

/// Classify one telemetry document. Flat objects and OpenTelemetry-style
/// `{"attributes": {...}}` records are both understood.
pub fn classify(doc: &Value) -> TelemetryRecord {
    let attrs = doc.get("attributes").filter(|a| a.is_object()).unwrap_or(doc);

    if let Some(name) = str_field(attrs, &["function_name", "tool_name"]) {
        let args = attrs
            .get("function_args")
            .or_else(|| attrs.get("args"))
            .or_else(|| attrs.get("arguments"))
            .map(normalize_args)
            .unwrap_or(Value::Object(Default::default()));
        let output = str_field(attrs, &["response", "output", "result"]).map(str::to_string);
        let success = attrs.get("success").and_then(Value::as_bool);
        return TelemetryRecord::ToolCall(ToolCallDescriptor {
            name: name.to_string(),
            args,
            output,
            success,
        });
    }

    let usage = attrs.get("usage").filter(|u| u.is_object()).unwrap_or(attrs);
    let tokens_in = u64_field(usage, &["input_token_count", "input_tokens", "tokensIn"]);
    let tokens_out = u64_field(usage, &["output_token_count", "output_tokens", "tokensOut"]);
    if tokens_in.is_some() || tokens_out.is_some() {
        return TelemetryRecord::Tokens(TokenSample {
            tokens_in: tokens_in.unwrap_or(0),
            tokens_out: tokens_out.unwrap_or(0),
            cached_tokens: u64_field(
                usage,
                &["cached_content_token_count", "cached_input_tokens", "cachedTokens"],
            )
            .unwrap_or(0),
            latency_ms: u64_field(attrs, &["duration_ms", "latency_ms", "latencyMs"]).unwrap_or(0),
            cost_usd: attrs
                .get("cost_usd")
                .or_else(|| attrs.get("total_cost_usd"))
                .and_then(Value::as_f64),
            model: str_field(attrs, &["model"]).map(str::to_string),
            context_window: u64_field(attrs, &["context_window", "model_context_window"]),
            recorded_at: str_field(attrs, &["event.timestamp", "timestamp"])
                .or_else(|| str_field(doc, &["timestamp"]))
                .map(str::to_string),
        });
    }

    TelemetryRecord::Unrecognized
}

/// Arguments sometimes arrive as a JSON-encoded string.
fn normalize_args(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        other => other.clone(),
    }
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

fn u64_field(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_u64))
}

/// Turns telemetry records into canonical events, once per tool call or
/// usage sample
///
/// The stdout reader and the side-channel poller may both see the same tool
/// call, and a poller may re-scan from an earlier offset; the fingerprint set
/// makes the first sighting win.
#[derive(Debug, Default)]
pub struct TelemetryMapper {
    seen: HashSet<String>,
    next_tool: u64,
}

impl TelemetryMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Has this tool call already been emitted?
    pub fn is_known(&self, call: &ToolCallDescriptor) -> bool {
        self.seen.contains(&call.fingerprint())
    }

    pub fn map(&mut self, record: TelemetryRecord, clock: &mut EventClock) -> Vec<Event> {
        match record {
            TelemetryRecord::Tokens(sample) => {
                if !self.seen.insert(sample.fingerprint()) {
                    debug!(tokens_in = sample.tokens_in, "Skipping already counted telemetry usage");
                    return Vec::new();
                }
                let mut events = Vec::new();
                if let Some(model) = sample.model.clone() {
                    events.push(Event::ModelUpdate {
                        model: Some(model),
                        timestamp: clock.now(),
                    });
                }
                let context = sample
                    .context_window
                    .and_then(|window| ContextUsage::compute(window, sample.tokens_in + sample.tokens_out));
                events.push(Event::TelemetryTokens {
                    tokens_in: sample.tokens_in,
                    tokens_out: sample.tokens_out,
                    cached_tokens: sample.cached_tokens,
                    latency_ms: sample.latency_ms,
                    context,
                    timestamp: clock.now(),
                });
                if let Some(usd) = sample.cost_usd {
                    events.push(Event::CostUpdate {
                        usd,
                        tokens_in: sample.tokens_in,
                        tokens_out: sample.tokens_out,
                        timestamp: clock.now(),
                    });
                }
                events
            }
            TelemetryRecord::ToolCall(call) => {
                if !self.seen.insert(call.fingerprint()) {
                    debug!(tool = %call.name, "Skipping already emitted telemetry tool call");
                    return Vec::new();
                }
                self.next_tool += 1;
                let id = format!("telemetry-{}", self.next_tool);
                let exit_code = call.success.map(|ok| if ok { 0 } else { 1 });
                vec![
                    Event::ToolStart {
                        id: id.clone(),
                        tool_kind: ToolKind::from_tool_name(&call.name),
                        name: call.name,
                        args: call.args,
                        timestamp: clock.now(),
                    },
                    Event::ToolOutput {
                        id,
                        chunk: call.output.unwrap_or_default(),
                        done: true,
                        exit_code,
                        stream: None,
                        timestamp: clock.now(),
                    },
                ]
            }
            TelemetryRecord::Unrecognized => Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
