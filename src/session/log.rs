//! Session event log - bounded, ordered store of reconciled events
//!
//! Assistant deltas and completions collapse into one `ReconciledMessage` per
//! id, tool output folds into its `ToolRun`, everything else is appended once.
//! Entries are keyed by an increasing sequence number so the log can evict from
//! the front and absorb orphaned tool output from the middle.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::checkpoint::CheckpointRecord;
use crate::config::LogConfig;
use crate::event::{ContentPart, ContextUsage, Event, Role, Timestamp, TokenCounts, ToolKind};

/// One logical message, updated in place as deltas and completions arrive
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledMessage {
    pub id: String,
    /// Other ids later completions used for this message
    pub aliases: Vec<String>,
    pub role: Role,
    pub text: String,
    pub content_parts: Vec<ContentPart>,
    pub model: Option<String>,
    pub tokens: Option<TokenCounts>,
    pub timestamp: Timestamp,
    pub updated_at: Timestamp,
    pub streaming: bool,
    pub interrupted: bool,
    /// Byte offset where the paragraph currently being streamed begins
    segment_start: usize,
}

impl ReconciledMessage {
    fn new(id: String, role: Role, text: String, timestamp: Timestamp) -> Self {
        Self {
            id,
            aliases: Vec::new(),
            role,
            text,
            content_parts: Vec::new(),
            model: None,
            tokens: None,
            timestamp,
            updated_at: timestamp,
            streaming: false,
            interrupted: false,
            segment_start: 0,
        }
    }

    /// The last paragraph, the one a completion may restate
    pub fn current_segment(&self) -> &str {
        &self.text[self.segment_start..]
    }

    fn begin_segment(&mut self) {
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        self.segment_start = self.text.len();
        self.streaming = true;
        self.interrupted = false;
    }

    fn replace_segment(&mut self, text: &str) {
        self.text.truncate(self.segment_start);
        self.text.push_str(text);
    }

    fn merge_metadata(&mut self, completion: &Completion) {
        if completion.model.is_some() {
            self.model = completion.model.clone();
        }
        if completion.tokens.is_some() {
            self.tokens = completion.tokens;
        }
        if !completion.content_parts.is_empty() {
            self.content_parts = completion.content_parts.clone();
        }
    }

    fn to_event(&self) -> Event {
        Event::Message {
            id: self.id.clone(),
            role: self.role,
            text: self.text.clone(),
            content_parts: self.content_parts.clone(),
            model: self.model.clone(),
            tokens: self.tokens,
            timestamp: self.timestamp,
        }
    }
}

/// A tool invocation with all of its output folded in
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRun {
    pub id: String,
    pub tool_kind: ToolKind,
    pub name: String,
    pub args: Value,
    pub output: String,
    pub done: bool,
    pub exit_code: Option<i32>,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ToolRun {
    fn absorb(&mut self, chunk: &str, done: bool, exit_code: Option<i32>, timestamp: Timestamp) {
        self.output.push_str(chunk);
        self.done |= done;
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
        self.updated_at = self.updated_at.max(timestamp);
    }

    fn has_output(&self) -> bool {
        !self.output.is_empty() || self.done
    }

    fn events(&self) -> Vec<Event> {
        let mut events = vec![Event::ToolStart {
            id: self.id.clone(),
            tool_kind: self.tool_kind,
            name: self.name.clone(),
            args: self.args.clone(),
            timestamp: self.started_at,
        }];
        if self.has_output() {
            events.push(Event::ToolOutput {
                id: self.id.clone(),
                chunk: self.output.clone(),
                done: self.done,
                exit_code: self.exit_code,
                stream: None,
                timestamp: self.updated_at,
            });
        }
        events
    }
}

/// One slot of the log
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Message(ReconciledMessage),
    Tool(ToolRun),
    /// Tool output whose start has not been seen
    Orphan(Event),
    Event(Event),
}

impl LogEntry {
    /// Number of events this entry renders as
    fn weight(&self) -> usize {
        match self {
            LogEntry::Tool(run) if run.has_output() => 2,
            _ => 1,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        match self {
            LogEntry::Message(msg) => vec![msg.to_event()],
            LogEntry::Tool(run) => run.events(),
            LogEntry::Orphan(event) | LogEntry::Event(event) => vec![event.clone()],
        }
    }
}

/// What `append` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Updated,
    Discarded,
}

/// Running token and cost counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cached_tokens: u64,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextUsage>,
}

struct Completion {
    id: String,
    text: String,
    interrupted: bool,
    model: Option<String>,
    tokens: Option<TokenCounts>,
    content_parts: Vec<ContentPart>,
}

impl Completion {
    fn plain(id: String, text: String, interrupted: bool) -> Self {
        Self {
            id,
            text,
            interrupted,
            model: None,
            tokens: None,
            content_parts: Vec::new(),
        }
    }
}

pub struct SessionEventLog {
    config: LogConfig,
    entries: BTreeMap<u64, LogEntry>,
    next_seq: u64,
    rendered_len: usize,
    message_count: usize,
    /// Message id or alias -> entry
    messages: HashMap<String, u64>,
    tools: HashMap<String, u64>,
    orphans: HashMap<String, Vec<u64>>,
    assistant_seqs: VecDeque<u64>,
    last_user_seq: Option<u64>,
    last_timestamp: Timestamp,
    usage: UsageTotals,
    checkpoints: Vec<CheckpointRecord>,
}

impl SessionEventLog {
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            next_seq: 0,
            rendered_len: 0,
            message_count: 0,
            messages: HashMap::new(),
            tools: HashMap::new(),
            orphans: HashMap::new(),
            assistant_seqs: VecDeque::new(),
            last_user_seq: None,
            last_timestamp: 0,
            usage: UsageTotals::default(),
            checkpoints: Vec::new(),
        }
    }

    /// Append one event, reconciling it with what is already there.
    pub fn append(&mut self, mut event: Event) -> AppendOutcome {
        let timestamp = event.timestamp().max(self.last_timestamp);
        self.last_timestamp = timestamp;
        *event.timestamp_mut() = timestamp;

        let outcome = match event {
            Event::AssistantDelta { id, chunk, .. } => self.apply_delta(id, chunk, timestamp),
            Event::AssistantComplete {
                id,
                text,
                interrupted,
                ..
            } => self.apply_completion(Completion::plain(id, text, interrupted), timestamp),
            Event::Message {
                id,
                role: Role::Assistant,
                text,
                content_parts,
                model,
                tokens,
                ..
            } => {
                if model.is_some() {
                    self.usage.model = model.clone();
                }
                let completion = Completion {
                    id,
                    text,
                    interrupted: false,
                    model,
                    tokens,
                    content_parts,
                };
                self.apply_completion(completion, timestamp)
            }
            Event::Message {
                id,
                role: Role::User,
                text,
                content_parts,
                ..
            } => self.apply_user_message(id, text, content_parts, timestamp),
            Event::ToolStart {
                id,
                tool_kind,
                name,
                args,
                ..
            } => self.start_tool(id, tool_kind, name, args, timestamp),
            Event::ToolOutput { .. } => self.apply_tool_output(event),
            other => {
                self.record(&other);
                self.push(LogEntry::Event(other));
                AppendOutcome::Inserted
            }
        };

        self.evict();
        outcome
    }

    /// Ordered, rendered view of the log
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.values().flat_map(LogEntry::events).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }

    /// Rendered length, the figure `max_events` bounds
    pub fn len(&self) -> usize {
        self.rendered_len
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Look up a message by id or alias
    pub fn message(&self, id: &str) -> Option<&ReconciledMessage> {
        match self.entries.get(self.messages.get(id)?)? {
            LogEntry::Message(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &ReconciledMessage> {
        self.entries.values().filter_map(|e| match e {
            LogEntry::Message(msg) => Some(msg),
            _ => None,
        })
    }

    pub fn tool_run(&self, id: &str) -> Option<&ToolRun> {
        match self.entries.get(self.tools.get(id)?)? {
            LogEntry::Tool(run) => Some(run),
            _ => None,
        }
    }

    pub fn usage(&self) -> &UsageTotals {
        &self.usage
    }

    pub fn checkpoints(&self) -> &[CheckpointRecord] {
        &self.checkpoints
    }

    /// Finalize every message still streaming, marking it interrupted.
    ///
    /// Used when a turn is abandoned without its adapter flushing.
    pub fn seal_streaming(&mut self) -> usize {
        let mut sealed = 0;
        for entry in self.entries.values_mut() {
            if let LogEntry::Message(msg) = entry {
                if msg.streaming {
                    msg.streaming = false;
                    msg.interrupted = true;
                    sealed += 1;
                }
            }
        }
        sealed
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn apply_delta(&mut self, id: String, chunk: String, timestamp: Timestamp) -> AppendOutcome {
        if let Some(LogEntry::Message(msg)) = self.messages.get(&id).and_then(|seq| self.entries.get_mut(seq)) {
            if !msg.streaming {
                msg.begin_segment();
            }
            msg.text.push_str(&chunk);
            msg.updated_at = timestamp;
            return AppendOutcome::Updated;
        }
        if chunk.is_empty() {
            return AppendOutcome::Discarded;
        }

        let mut msg = ReconciledMessage::new(id, Role::Assistant, chunk, timestamp);
        msg.streaming = true;
        self.insert_message(msg);
        AppendOutcome::Inserted
    }

    fn apply_completion(&mut self, completion: Completion, timestamp: Timestamp) -> AppendOutcome {
        if let Some(seq) = self.messages.get(&completion.id).copied() {
            return self.complete_message(seq, completion, timestamp);
        }
        if completion.text.is_empty() {
            return AppendOutcome::Discarded;
        }
        if self.is_recent_duplicate(&completion.text) {
            debug!(message_id = %completion.id, "Dropping re-emitted assistant reply");
            return AppendOutcome::Discarded;
        }

        if let Some(seq) = self.migration_target() {
            if let Some(LogEntry::Message(msg)) = self.entries.get_mut(&seq) {
                debug!(from = %completion.id, to = %msg.id, "Completion migrated to current reply");
                msg.aliases.push(completion.id.clone());
                self.messages.insert(completion.id.clone(), seq);
                return self.complete_message(seq, completion, timestamp);
            }
        }

        let mut msg = ReconciledMessage::new(completion.id.clone(), Role::Assistant, String::new(), timestamp);
        msg.merge_metadata(&completion);
        msg.text = completion.text;
        msg.interrupted = completion.interrupted;
        self.insert_message(msg);
        AppendOutcome::Inserted
    }

    fn complete_message(&mut self, seq: u64, completion: Completion, timestamp: Timestamp) -> AppendOutcome {
        let Some(LogEntry::Message(msg)) = self.entries.get_mut(&seq) else {
            return AppendOutcome::Discarded;
        };
        msg.merge_metadata(&completion);
        let text = completion.text;

        if msg.streaming {
            if !text.is_empty() {
                msg.replace_segment(&text);
            }
            msg.streaming = false;
            msg.interrupted = completion.interrupted;
            msg.updated_at = timestamp;
            return AppendOutcome::Updated;
        }

        let segment = msg.current_segment();
        if text.is_empty()
            || text == msg.text
            || text == segment
            || msg.text.starts_with(&text)
            || segment.starts_with(&text)
        {
            return AppendOutcome::Discarded;
        }

        if text.starts_with(&msg.text) {
            msg.text = text;
            msg.segment_start = 0;
        } else if text.starts_with(segment) {
            msg.replace_segment(&text);
        } else {
            // a distinct utterance under the same id
            msg.begin_segment();
            msg.text.push_str(&text);
            msg.streaming = false;
        }
        msg.interrupted = completion.interrupted;
        msg.updated_at = timestamp;
        AppendOutcome::Updated
    }

    /// Does `text` repeat one of the last few finalized assistant replies?
    fn is_recent_duplicate(&self, text: &str) -> bool {
        self.assistant_seqs
            .iter()
            .rev()
            .take(self.config.recent_dedup_window)
            .filter_map(|seq| match self.entries.get(seq) {
                Some(LogEntry::Message(msg)) => Some(msg),
                _ => None,
            })
            .any(|msg| !msg.streaming && msg.text == text)
    }

    /// The reply a completion with an unseen id should attach to: the most
    /// recent assistant message, if no user message followed it.
    fn migration_target(&self) -> Option<u64> {
        let seq = *self.assistant_seqs.back()?;
        if self.last_user_seq.is_some_and(|user| user > seq) {
            return None;
        }
        Some(seq)
    }

    fn apply_user_message(
        &mut self,
        id: String,
        text: String,
        content_parts: Vec<ContentPart>,
        timestamp: Timestamp,
    ) -> AppendOutcome {
        if let Some(LogEntry::Message(msg)) = self.messages.get(&id).and_then(|seq| self.entries.get_mut(seq)) {
            if msg.text == text {
                return AppendOutcome::Discarded;
            }
            msg.text = text;
            msg.updated_at = timestamp;
            return AppendOutcome::Updated;
        }

        let mut msg = ReconciledMessage::new(id, Role::User, text, timestamp);
        msg.content_parts = content_parts;
        let seq = self.insert_message(msg);
        self.last_user_seq = Some(seq);
        AppendOutcome::Inserted
    }

    fn start_tool(
        &mut self,
        id: String,
        tool_kind: ToolKind,
        name: String,
        args: Value,
        timestamp: Timestamp,
    ) -> AppendOutcome {
        if self.tools.contains_key(&id) {
            debug!(tool_id = %id, "Duplicate tool start dropped");
            return AppendOutcome::Discarded;
        }

        let mut run = ToolRun {
            id: id.clone(),
            tool_kind,
            name,
            args,
            output: String::new(),
            done: false,
            exit_code: None,
            started_at: timestamp,
            updated_at: timestamp,
        };
        for seq in self.orphans.remove(&id).unwrap_or_default() {
            if let Some(LogEntry::Orphan(Event::ToolOutput {
                chunk, done, exit_code, ..
            })) = self.remove_entry(seq)
            {
                run.absorb(&chunk, done, exit_code, timestamp);
            }
        }

        let seq = self.push(LogEntry::Tool(run));
        self.tools.insert(id, seq);
        AppendOutcome::Inserted
    }

    fn apply_tool_output(&mut self, event: Event) -> AppendOutcome {
        let known = matches!(&event, Event::ToolOutput { id, .. } if self.tools.contains_key(id));
        if known {
            self.merge_tool_output(event)
        } else {
            self.keep_orphan(event)
        }
    }

    fn merge_tool_output(&mut self, event: Event) -> AppendOutcome {
        let Event::ToolOutput {
            id,
            chunk,
            done,
            exit_code,
            timestamp,
            ..
        } = event
        else {
            return AppendOutcome::Discarded;
        };
        let Some(LogEntry::Tool(run)) = self.tools.get(&id).and_then(|seq| self.entries.get_mut(seq)) else {
            return AppendOutcome::Discarded;
        };

        let had_output = run.has_output();
        run.absorb(&chunk, done, exit_code, timestamp);
        if !had_output && run.has_output() {
            self.rendered_len += 1;
        }
        AppendOutcome::Updated
    }

    fn keep_orphan(&mut self, event: Event) -> AppendOutcome {
        let Event::ToolOutput { id, .. } = &event else {
            return AppendOutcome::Discarded;
        };
        debug!(tool_id = %id, "Tool output before its start, kept unattached");
        let id = id.clone();
        let seq = self.push(LogEntry::Orphan(event));
        self.orphans.entry(id).or_default().push(seq);
        AppendOutcome::Inserted
    }

    /// Side effects of append-once events
    fn record(&mut self, event: &Event) {
        match event {
            Event::CheckpointCreate {
                id,
                trigger,
                file_snapshots,
                timestamp,
                ..
            } => self.checkpoints.push(CheckpointRecord {
                id: id.clone(),
                timestamp: *timestamp,
                trigger: trigger.clone(),
                file_count: file_snapshots.len(),
            }),
            Event::CostUpdate { usd, .. } => self.usage.usd += usd,
            Event::TelemetryTokens {
                tokens_in,
                tokens_out,
                cached_tokens,
                latency_ms,
                context,
                ..
            } => {
                self.usage.tokens_in += tokens_in;
                self.usage.tokens_out += tokens_out;
                self.usage.cached_tokens += cached_tokens;
                self.usage.latency_ms += latency_ms;
                if context.is_some() {
                    self.usage.context = *context;
                }
            }
            Event::ModelUpdate { model: Some(model), .. } => self.usage.model = Some(model.clone()),
            _ => {}
        }
    }

    fn insert_message(&mut self, msg: ReconciledMessage) -> u64 {
        let id = msg.id.clone();
        let role = msg.role;
        let seq = self.push(LogEntry::Message(msg));
        self.messages.insert(id, seq);
        if role == Role::Assistant {
            self.assistant_seqs.push_back(seq);
        }
        seq
    }

    fn push(&mut self, entry: LogEntry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rendered_len += entry.weight();
        if matches!(entry, LogEntry::Message(_)) {
            self.message_count += 1;
        }
        self.entries.insert(seq, entry);
        seq
    }

    fn remove_entry(&mut self, seq: u64) -> Option<LogEntry> {
        let entry = self.entries.remove(&seq)?;
        self.rendered_len -= entry.weight();
        if matches!(entry, LogEntry::Message(_)) {
            self.message_count -= 1;
        }
        Some(entry)
    }

    /// Drop whole entries from the front until both caps hold.
    fn evict(&mut self) {
        let max_events = self.config.max_events.max(1);
        let max_messages = self.config.max_messages.max(1);
        while self.rendered_len > max_events || self.message_count > max_messages {
            let Some(seq) = self.entries.keys().next().copied() else {
                break;
            };
            if let Some(entry) = self.remove_entry(seq) {
                self.unindex(seq, &entry);
            }
        }
    }

    fn unindex(&mut self, seq: u64, entry: &LogEntry) {
        match entry {
            LogEntry::Message(msg) => {
                for id in std::iter::once(&msg.id).chain(msg.aliases.iter()) {
                    if self.messages.get(id) == Some(&seq) {
                        self.messages.remove(id);
                    }
                }
                self.assistant_seqs.retain(|s| *s != seq);
            }
            LogEntry::Tool(run) => {
                if self.tools.get(&run.id) == Some(&seq) {
                    self.tools.remove(&run.id);
                }
            }
            LogEntry::Orphan(Event::ToolOutput { id, .. }) => {
                if let Some(seqs) = self.orphans.get_mut(id) {
                    seqs.retain(|s| *s != seq);
                    if seqs.is_empty() {
                        self.orphans.remove(id);
                    }
                }
            }
            _ => {}
        }
    }
}

impl Default for SessionEventLog {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}
