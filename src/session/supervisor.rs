//! Run supervisor - one active turn per session, the rest wait in FIFO order

use std::collections::VecDeque;
use tracing::info;

use crate::adapter::TurnRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running { turn_id: String },
    /// Interrupted; new turns queue until the stop is acknowledged
    Stopping { turn_id: String },
}

/// A turn waiting for, or holding, the session
#[derive(Debug, Clone)]
pub struct QueuedTurn {
    pub turn_id: String,
    pub request: TurnRequest,
}

/// Result of submitting a turn
#[derive(Debug, Clone)]
pub enum Submission {
    /// The session was idle; the caller must launch this turn now
    Started(QueuedTurn),
    /// Waiting behind the active turn, 1-based position
    Queued { turn_id: String, position: usize },
}

#[derive(Debug)]
pub struct RunSupervisor {
    session_id: String,
    state: RunState,
    queue: VecDeque<QueuedTurn>,
    next_turn: u64,
}

impl RunSupervisor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: RunState::Idle,
            queue: VecDeque::new(),
            next_turn: 1,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running { .. })
    }

    /// Running or still stopping an interrupted turn
    pub fn is_busy(&self) -> bool {
        self.state != RunState::Idle
    }

    pub fn active_turn(&self) -> Option<&str> {
        match &self.state {
            RunState::Running { turn_id } => Some(turn_id),
            RunState::Idle | RunState::Stopping { .. } => None,
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn submit(&mut self, request: TurnRequest) -> Submission {
        let turn = QueuedTurn {
            turn_id: format!("turn-{}", self.next_turn),
            request,
        };
        self.next_turn += 1;

        if self.is_busy() {
            let turn_id = turn.turn_id.clone();
            self.queue.push_back(turn);
            info!(session_id = %self.session_id, turn_id = %turn_id, position = self.queue.len(), "Turn queued");
            return Submission::Queued {
                turn_id,
                position: self.queue.len(),
            };
        }

        self.start(turn.turn_id.clone());
        Submission::Started(turn)
    }

    /// The active turn finished. Returns the next turn to launch, if any.
    ///
    /// A stale id (a turn already interrupted) changes nothing.
    pub fn complete(&mut self, turn_id: &str) -> Option<QueuedTurn> {
        if self.active_turn() != Some(turn_id) {
            return None;
        }
        self.state = RunState::Idle;
        self.advance()
    }

    /// Move `running -> stopping`; returns the turn that was active.
    pub fn interrupt(&mut self) -> Option<String> {
        let RunState::Running { turn_id } = &self.state else {
            return None;
        };
        let turn_id = turn_id.clone();
        info!(session_id = %self.session_id, turn_id = %turn_id, "Turn interrupted");
        self.state = RunState::Stopping {
            turn_id: turn_id.clone(),
        };
        Some(turn_id)
    }

    /// The interrupted turn is flushed and stopped: go idle and hand back the
    /// next queued turn. Ignored unless `turn_id` is the one stopping.
    pub fn finish_interrupt(&mut self, turn_id: &str) -> Option<QueuedTurn> {
        match &self.state {
            RunState::Stopping { turn_id: stopping } if stopping == turn_id => {
                self.state = RunState::Idle;
                self.advance()
            }
            _ => None,
        }
    }

    /// Start the next queued turn if the session is idle.
    pub fn advance(&mut self) -> Option<QueuedTurn> {
        if self.is_busy() {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.start(next.turn_id.clone());
        Some(next)
    }

    /// Drop every waiting turn; returns how many were dropped.
    pub fn clear_queue(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    fn start(&mut self, turn_id: String) {
        info!(session_id = %self.session_id, turn_id = %turn_id, "Turn started");
        self.state = RunState::Running { turn_id };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_id(submission: Submission) -> String {
        match submission {
            Submission::Started(turn) => turn.turn_id,
            other => panic!("Expected Started, got {:?}", other),
        }
    }

    #[test]
    fn test_turns_run_one_at_a_time() {
        let mut supervisor = RunSupervisor::new("s1");
        let first = started_id(supervisor.submit(TurnRequest::new("one")));
        assert_eq!(supervisor.active_turn(), Some(first.as_str()));

        match supervisor.submit(TurnRequest::new("two")) {
            Submission::Queued { position, .. } => assert_eq!(position, 1),
            other => panic!("Expected Queued, got {:?}", other),
        }
        match supervisor.submit(TurnRequest::new("three")) {
            Submission::Queued { position, .. } => assert_eq!(position, 2),
            other => panic!("Expected Queued, got {:?}", other),
        }

        let next = supervisor.complete(&first).unwrap();
        assert_eq!(next.request.prompt, "two");
        assert_eq!(supervisor.active_turn(), Some(next.turn_id.as_str()));
        assert_eq!(supervisor.queue_len(), 1);
    }

    #[test]
    fn test_completion_without_queue_goes_idle() {
        let mut supervisor = RunSupervisor::new("s1");
        let first = started_id(supervisor.submit(TurnRequest::new("one")));
        assert!(supervisor.complete(&first).is_none());
        assert_eq!(supervisor.state(), &RunState::Idle);
    }

    #[test]
    fn test_interrupt_then_advance() {
        let mut supervisor = RunSupervisor::new("s1");
        let first = started_id(supervisor.submit(TurnRequest::new("one")));
        supervisor.submit(TurnRequest::new("two"));

        assert_eq!(supervisor.interrupt(), Some(first.clone()));
        assert!(!supervisor.is_running());
        assert!(supervisor.is_busy());
        // the interrupted turn's late exit is ignored
        assert!(supervisor.complete(&first).is_none());
        assert!(supervisor.advance().is_none());

        let next = supervisor.finish_interrupt(&first).unwrap();
        assert_eq!(next.request.prompt, "two");
        assert!(supervisor.advance().is_none());
    }

    #[test]
    fn test_submissions_queue_while_stopping() {
        let mut supervisor = RunSupervisor::new("s1");
        let first = started_id(supervisor.submit(TurnRequest::new("one")));
        supervisor.interrupt();
        assert_eq!(supervisor.state(), &RunState::Stopping { turn_id: first.clone() });

        match supervisor.submit(TurnRequest::new("two")) {
            Submission::Queued { turn_id, position } => {
                assert_eq!(turn_id, "turn-2");
                assert_eq!(position, 1);
            }
            other => panic!("Expected Queued, got {:?}", other),
        }
        // a second interrupt while stopping does nothing
        assert!(supervisor.interrupt().is_none());
        assert!(supervisor.finish_interrupt("turn-9").is_none());

        let next = supervisor.finish_interrupt(&first).unwrap();
        assert_eq!(next.turn_id, "turn-2");
        assert_eq!(supervisor.active_turn(), Some("turn-2"));
    }

    #[test]
    fn test_finish_interrupt_without_queue_goes_idle() {
        let mut supervisor = RunSupervisor::new("s1");
        let first = started_id(supervisor.submit(TurnRequest::new("one")));
        supervisor.interrupt();
        assert!(supervisor.finish_interrupt(&first).is_none());
        assert_eq!(supervisor.state(), &RunState::Idle);
    }

    #[test]
    fn test_clear_queue() {
        let mut supervisor = RunSupervisor::new("s1");
        supervisor.submit(TurnRequest::new("one"));
        supervisor.submit(TurnRequest::new("two"));
        supervisor.submit(TurnRequest::new("three"));
        assert_eq!(supervisor.clear_queue(), 2);
        assert_eq!(supervisor.interrupt().as_deref(), Some("turn-1"));
        assert!(supervisor.interrupt().is_none());
    }
}
