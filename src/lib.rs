//! Agent Stream - reconcile coding-agent output streams into one ordered event log

pub mod adapter;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod event;
pub mod infra;
pub mod process;
pub mod session;

pub use adapter::{get_adapter, Backend, ProtocolFamily, StreamAdapter, TurnInput, TurnOptions, TurnRequest};
pub use checkpoint::{CheckpointRecord, CheckpointStore, CheckpointTrigger, RestoreMode};
pub use config::EngineConfig;
pub use event::{ContentPart, Event, OutputStream, PermissionScope, Role, Timestamp, TokenCounts, ToolKind};
pub use infra::{sanitize, Sanitizer, TelemetryMapper, TelemetryScanner};
pub use process::{CommandLauncher, LaunchedTurn, TurnLauncher};
pub use session::{
    AppendOutcome, ReconciledMessage, RunState, Session, SessionEventLog, StreamPipeline, ToolRun, TurnStatus,
    UsageTotals,
};
