//! Sessions - reconciled event log, turn queue and the runtime tying them to a process

pub mod log;
pub mod pipeline;
pub mod runtime;
pub mod supervisor;

pub use log::{AppendOutcome, LogEntry, ReconciledMessage, SessionEventLog, ToolRun, UsageTotals};
pub use pipeline::StreamPipeline;
pub use runtime::{Session, TurnStatus};
pub use supervisor::{QueuedTurn, RunState, RunSupervisor, Submission};
