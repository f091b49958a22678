// src/adapter/stream.rs
//! Message streaming state shared by every adapter
//!
//! `idle -> streaming(id, text) -> idle`. Deltas for the active id append;
//! a delta for another id first completes the active message, so an adapter
//! never leaves a message half-open when the backend moves on.

use tracing::debug;

use crate::event::{Event, EventClock};

#[derive(Debug)]
struct Streaming {
    id: String,
    text: String,
}

#[derive(Debug, Default)]
pub struct StreamState {
    pub clock: EventClock,
    current: Option<Streaming>,
    produced_output: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn; any leftover stream is discarded.
    pub fn begin_turn(&mut self) {
        if let Some(stale) = self.current.take() {
            debug!(message_id = %stale.id, "Discarding stale stream at turn start");
        }
        self.produced_output = false;
    }

    pub fn streaming_id(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.id.as_str())
    }

    pub fn accumulated(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.text.as_str())
    }

    /// Record that the backend produced something this turn.
    pub fn track(&mut self, events: Vec<Event>) -> Vec<Event> {
        if !events.is_empty() {
            self.produced_output = true;
        }
        events
    }

    pub fn produced_output(&self) -> bool {
        self.produced_output
    }

    pub fn delta(&mut self, id: &str, chunk: &str) -> Vec<Event> {
        if chunk.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();
        if self.streaming_id().is_some_and(|current| current != id) {
            events.extend(self.complete_current());
        }
        match self.current.as_mut() {
            Some(streaming) => streaming.text.push_str(chunk),
            None => {
                self.current = Some(Streaming {
                    id: id.to_string(),
                    text: chunk.to_string(),
                })
            }
        }
        events.push(Event::AssistantDelta {
            id: id.to_string(),
            chunk: chunk.to_string(),
            timestamp: self.clock.now(),
        });
        events
    }

    /// Complete message `id`. The backend's final text wins whenever it is
    /// non-empty and at least as long as what was accumulated.
    pub fn complete(&mut self, id: &str, final_text: Option<&str>) -> Vec<Event> {
        let mut events = Vec::new();
        let accumulated = match self.current.take() {
            Some(streaming) if streaming.id == id => Some(streaming.text),
            Some(other) => {
                self.current = Some(other);
                events.extend(self.complete_current());
                None
            }
            None => None,
        };

        let final_text = final_text.filter(|t| !t.is_empty());
        let text = match (final_text, accumulated) {
            (Some(fin), Some(acc)) if fin.len() >= acc.len() => fin.to_string(),
            (Some(_), Some(acc)) => acc,
            (Some(fin), None) => fin.to_string(),
            (None, Some(acc)) => acc,
            (None, None) => return events,
        };

        events.push(Event::AssistantComplete {
            id: id.to_string(),
            text,
            interrupted: false,
            timestamp: self.clock.now(),
        });
        events
    }

    /// Complete whatever is streaming with its accumulated text.
    pub fn complete_current(&mut self) -> Vec<Event> {
        self.flush(false)
    }

    /// Flush the active message marked as interrupted.
    pub fn interrupt(&mut self) -> Vec<Event> {
        self.flush(true)
    }

    fn flush(&mut self, interrupted: bool) -> Vec<Event> {
        match self.current.take() {
            Some(streaming) => vec![Event::AssistantComplete {
                id: streaming.id,
                text: streaming.text,
                interrupted,
                timestamp: self.clock.now(),
            }],
            None => Vec::new(),
        }
    }

    /// End of the subprocess stream.
    ///
    /// A partial message is kept and marked terminal; a failed exit or a run
    /// that produced nothing is surfaced as one error event.
    pub fn finish(&mut self, exit_code: Option<i32>) -> Vec<Event> {
        let failed = exit_code != Some(0);
        let mut events = self.flush(failed);
        if failed || !self.produced_output {
            let message = match exit_code {
                Some(0) => "Agent exited without producing output".to_string(),
                Some(code) => format!("Agent exited with code {}", code),
                None => "Agent terminated by signal".to_string(),
            };
            events.push(Event::Error {
                message,
                exit_code,
                timestamp: self.clock.now(),
            });
        }
        self.produced_output = false;
        events
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.produced_output = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_text(events: &[Event]) -> Option<(String, bool)> {
        events.iter().find_map(|e| match e {
            Event::AssistantComplete { text, interrupted, .. } => Some((text.clone(), *interrupted)),
            _ => None,
        })
    }

    #[test]
    fn test_deltas_then_complete_prefers_final_text() {
        let mut state = StreamState::new();
        state.delta("m1", "Hel");
        state.delta("m1", "lo");
        let events = state.complete("m1", Some("Hello"));
        assert_eq!(completed_text(&events), Some(("Hello".into(), false)));
        assert!(state.streaming_id().is_none());
    }

    #[test]
    fn test_shorter_final_text_loses() {
        let mut state = StreamState::new();
        state.delta("m1", "Hello world");
        let events = state.complete("m1", Some("Hello"));
        assert_eq!(completed_text(&events), Some(("Hello world".into(), false)));
    }

    #[test]
    fn test_empty_final_text_keeps_accumulated() {
        let mut state = StreamState::new();
        state.delta("m1", "partial");
        let events = state.complete("m1", Some(""));
        assert_eq!(completed_text(&events), Some(("partial".into(), false)));
    }

    #[test]
    fn test_delta_for_new_id_completes_previous() {
        let mut state = StreamState::new();
        state.delta("m1", "first");
        let events = state.delta("m2", "second");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::AssistantComplete { id, .. } if id == "m1"));
        assert_eq!(state.streaming_id(), Some("m2"));
    }

    #[test]
    fn test_interrupt_marks_partial() {
        let mut state = StreamState::new();
        state.delta("m1", "partial");
        let events = state.interrupt();
        assert_eq!(completed_text(&events), Some(("partial".into(), true)));
        assert!(state.interrupt().is_empty());
    }

    #[test]
    fn test_finish_without_output_is_single_error() {
        let mut state = StreamState::new();
        let events = state.finish(Some(2));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Error { exit_code: Some(2), .. }));
    }

    #[test]
    fn test_finish_mid_stream_keeps_partial_text() {
        let mut state = StreamState::new();
        let delta = state.delta("m1", "half a thou");
        state.track(delta);
        let events = state.finish(None);
        assert_eq!(completed_text(&events), Some(("half a thou".into(), true)));
        assert!(matches!(events.last(), Some(Event::Error { exit_code: None, .. })));
    }

    #[test]
    fn test_clean_finish_emits_nothing_extra() {
        let mut state = StreamState::new();
        let delta = state.delta("m1", "done");
        state.track(delta);
        let events = state.finish(Some(0));
        assert_eq!(events.len(), 1);
        assert_eq!(completed_text(&events), Some(("done".into(), false)));
    }
}
