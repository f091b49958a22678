//! Session runtime - drives turns from a launcher through the pipeline into the log
//!
//! Per turn there is one reader task for stdout and, when the backend writes a
//! telemetry file, one poller. Both push events through the shared pipeline
//! into a single writer task, which appends to the log and broadcasts what it
//! kept. Interrupts are cooperative: the reader is cancelled, the partial
//! reply is flushed, then the process is asked to stop and gets a bounded
//! grace period. Checkpoint files are written by a separate persistence task
//! so disk and git never stall the writer.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::log::{AppendOutcome, SessionEventLog, UsageTotals};
use super::pipeline::StreamPipeline;
use super::supervisor::{QueuedTurn, RunState, RunSupervisor, Submission};
use crate::adapter::{Backend, TurnRequest};
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::config::EngineConfig;
use crate::event::{Event, EventClock, PermissionScope};
use crate::infra::TelemetryTail;
use crate::process::{LaunchedTurn, TurnLauncher};

const BROADCAST_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 8192;

/// Result of `run_turn`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Started { turn_id: String },
    Queued { turn_id: String, position: usize },
}

enum WriterMsg {
    Event(Event),
    /// Finalize anything left streaming by the interrupted turn
    Seal { turn_id: String },
    Clear,
    Flush(oneshot::Sender<()>),
}

enum PersistMsg {
    Event(Event),
    Clear,
    Flush(oneshot::Sender<()>),
}

type SharedStdin = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

struct ActiveTurn {
    turn_id: String,
    interrupt: CancellationToken,
    stdin: Option<SharedStdin>,
    task: JoinHandle<()>,
}

struct Inner {
    id: String,
    config: EngineConfig,
    launcher: Arc<dyn TurnLauncher>,
    pipeline: Mutex<StreamPipeline>,
    log: Arc<Mutex<SessionEventLog>>,
    supervisor: Mutex<RunSupervisor>,
    active: Mutex<Option<ActiveTurn>>,
    writer: mpsc::UnboundedSender<WriterMsg>,
    events: broadcast::Sender<Event>,
    idle: watch::Sender<bool>,
    clock: Mutex<EventClock>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn send(&self, events: Vec<Event>) {
        for event in events {
            let _ = self.writer.send(WriterMsg::Event(event));
        }
    }

    /// Run `f` on the pipeline and hand its events to the writer while the
    /// pipeline is still locked, so producers cannot interleave a batch.
    fn feed_pipeline<F>(&self, f: F)
    where
        F: FnOnce(&mut StreamPipeline) -> Vec<Event>,
    {
        let mut pipeline = lock(&self.pipeline);
        let events = f(&mut pipeline);
        self.send(events);
    }

    /// `feed_pipeline` for a turn's producers. The token is checked under the
    /// pipeline lock, so once an interrupt has flushed the pipeline nothing
    /// more from that turn gets in.
    fn feed_turn<F>(&self, interrupt: &CancellationToken, f: F)
    where
        F: FnOnce(&mut StreamPipeline) -> Vec<Event>,
    {
        self.feed_pipeline(|p| if interrupt.is_cancelled() { Vec::new() } else { f(p) });
    }

    fn now(&self) -> i64 {
        lock(&self.clock).now()
    }
}

/// One logical session: a backend adapter, its event log and its turn queue
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create a session. Must be called inside a tokio runtime.
    pub fn new(
        id: impl Into<String>,
        backend: Backend,
        cwd: impl Into<PathBuf>,
        config: EngineConfig,
        launcher: Arc<dyn TurnLauncher>,
    ) -> Self {
        let cwd = cwd.into();
        let pipeline = StreamPipeline::new(backend, cwd.clone(), &config);
        let store = config.checkpoints.persist.then(|| CheckpointStore::new(cwd));
        Self::with_pipeline(id, pipeline, store, config, launcher)
    }

    pub fn with_pipeline(
        id: impl Into<String>,
        pipeline: StreamPipeline,
        store: Option<CheckpointStore>,
        config: EngineConfig,
        launcher: Arc<dyn TurnLauncher>,
    ) -> Self {
        let id = id.into();
        let log = Arc::new(Mutex::new(SessionEventLog::new(config.log.clone())));
        let (writer, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (idle, _) = watch::channel(true);

        tokio::spawn(run_writer(
            rx,
            log.clone(),
            events.clone(),
            store,
            config.checkpoints.keep,
            id.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                supervisor: Mutex::new(RunSupervisor::new(id.clone())),
                id,
                config,
                launcher,
                pipeline: Mutex::new(pipeline),
                log,
                active: Mutex::new(None),
                writer,
                events,
                idle,
                clock: Mutex::new(EventClock::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> RunState {
        lock(&self.inner.supervisor).state().clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.supervisor).is_running()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner.supervisor).queue_len()
    }

    /// Submit a turn; it starts now if the session is idle, else it queues.
    pub fn run_turn(&self, request: TurnRequest) -> Result<TurnStatus> {
        let submission = lock(&self.inner.supervisor).submit(request);
        match submission {
            Submission::Queued { turn_id, position } => Ok(TurnStatus::Queued { turn_id, position }),
            Submission::Started(turn) => {
                let turn_id = turn.turn_id.clone();
                if let Err(e) = launch_turn(&self.inner, turn) {
                    let next = lock(&self.inner.supervisor).complete(&turn_id);
                    start_next(&self.inner, next);
                    return Err(e);
                }
                start_next(&self.inner, None);
                Ok(TurnStatus::Started { turn_id })
            }
        }
    }

    /// Stop the active turn. The partial reply is finalized as interrupted and
    /// the next queued turn, if any, starts. Returns false when idle.
    ///
    /// Turns submitted while the interrupt is in flight queue behind it.
    pub async fn interrupt(&self) -> bool {
        let Some(turn_id) = self.stop_active().await else {
            return false;
        };
        self.finish_interrupt(&turn_id);
        true
    }

    /// Interrupt, drop queued turns and start the backend conversation afresh.
    /// The log keeps its history.
    pub async fn restart(&self) {
        self.restart_with(false).await;
    }

    /// Restart and clear the log.
    pub async fn reset(&self) {
        self.restart_with(true).await;
        self.flush().await;
    }

    async fn restart_with(&self, clear_log: bool) {
        let dropped = lock(&self.inner.supervisor).clear_queue();
        let stopped = self.stop_active().await;
        lock(&self.inner.pipeline).reset();
        if clear_log {
            let _ = self.inner.writer.send(WriterMsg::Clear);
        }
        if let Some(turn_id) = stopped {
            self.finish_interrupt(&turn_id);
        }
        info!(session_id = %self.inner.id, dropped, clear_log, "Session restarted");
    }

    /// Cancel the running turn and flush its partial output, then give the
    /// process its grace period. The supervisor stays `Stopping` until
    /// `finish_interrupt`.
    async fn stop_active(&self) -> Option<String> {
        let inner = &self.inner;
        let turn_id = lock(&inner.supervisor).interrupt()?;

        let active = lock(&inner.active).take();
        if let Some(active) = &active {
            active.interrupt.cancel();
        }
        inner.feed_pipeline(|p| p.interrupt());
        let _ = inner.writer.send(WriterMsg::Seal {
            turn_id: turn_id.clone(),
        });
        info!(session_id = %inner.id, turn_id = %turn_id, "Interrupt acknowledged");

        if let Some(active) = active {
            let wait = inner.config.supervisor.interrupt_grace() + Duration::from_millis(500);
            if tokio::time::timeout(wait, active.task).await.is_err() {
                warn!(session_id = %inner.id, turn_id = %turn_id, "Turn reader still running after grace period");
            }
        }
        Some(turn_id)
    }

    fn finish_interrupt(&self, turn_id: &str) {
        let next = lock(&self.inner.supervisor).finish_interrupt(turn_id);
        start_next(&self.inner, next);
    }

    /// Wait until every event handed to the writer has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.writer.send(WriterMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Ordered, reconciled events
    pub async fn snapshot(&self) -> Vec<Event> {
        self.flush().await;
        lock(&self.inner.log).snapshot()
    }

    /// Live events, in append order, without discarded duplicates
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub async fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.flush().await;
        lock(&self.inner.log).checkpoints().to_vec()
    }

    pub async fn usage(&self) -> UsageTotals {
        self.flush().await;
        lock(&self.inner.log).usage().clone()
    }

    /// Resolves once no turn is running and none is queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Answer a permission request raised by the active agent.
    pub async fn resolve_permission(&self, request_id: &str, allow: bool, scope: PermissionScope) -> Result<()> {
        let reply = {
            let mut pipeline = lock(&self.inner.pipeline);
            let resolution = pipeline.resolve_permission(request_id, allow, scope)?;
            self.inner.send(vec![resolution.event]);
            resolution.reply
        };
        let Some(reply) = reply else {
            return Ok(());
        };

        let stdin = lock(&self.inner.active).as_ref().and_then(|a| a.stdin.clone());
        let Some(stdin) = stdin else {
            debug!(session_id = %self.inner.id, request_id, "No agent stdin for permission reply");
            return Ok(());
        };
        let mut writer = stdin.lock().await;
        writer
            .write_all(format!("{}\n", reply).as_bytes())
            .await
            .context("Failed to send permission reply")?;
        writer.flush().await?;
        Ok(())
    }
}

fn launch_turn(inner: &Arc<Inner>, turn: QueuedTurn) -> Result<()> {
    let QueuedTurn { turn_id, request } = turn;
    inner.send(vec![Event::user_message(
        format!("{}:user", turn_id),
        request.prompt.clone(),
        inner.now(),
    )]);

    let input = {
        let mut pipeline = lock(&inner.pipeline);
        pipeline.begin_turn(&turn_id);
        pipeline.encode_turn(&request)
    };

    // held across spawn so a fast turn cannot clear a slot it does not own yet
    let mut active = lock(&inner.active);
    let launched = match inner.launcher.launch(&input) {
        Ok(launched) => launched,
        Err(e) => {
            warn!(session_id = %inner.id, turn_id = %turn_id, error = %e, "Agent launch failed");
            inner.send(vec![Event::Error {
                message: format!("Failed to launch {}: {}", input.program, e),
                exit_code: None,
                timestamp: inner.now(),
            }]);
            return Err(e);
        }
    };
    info!(session_id = %inner.id, turn_id = %turn_id, program = %input.program, "Agent launched");

    let LaunchedTurn {
        stdout,
        stdin,
        kill,
        exit,
    } = launched;
    let interrupt = CancellationToken::new();
    let task = tokio::spawn(drive_turn(
        inner.clone(),
        turn_id.clone(),
        stdout,
        kill,
        exit,
        interrupt.clone(),
        input.telemetry_path.clone(),
    ));
    *active = Some(ActiveTurn {
        turn_id,
        interrupt,
        stdin: stdin.map(|w| Arc::new(tokio::sync::Mutex::new(w))),
        task,
    });
    Ok(())
}

/// Launch `next`, skipping over turns that fail to launch, then publish idleness.
fn start_next(inner: &Arc<Inner>, mut next: Option<QueuedTurn>) {
    while let Some(turn) = next.take() {
        let turn_id = turn.turn_id.clone();
        if launch_turn(inner, turn).is_err() {
            next = lock(&inner.supervisor).complete(&turn_id);
        }
    }
    let supervisor = lock(&inner.supervisor);
    inner.idle.send_replace(!supervisor.is_busy());
}

async fn drive_turn(
    inner: Arc<Inner>,
    turn_id: String,
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    kill: CancellationToken,
    mut exit: oneshot::Receiver<Option<i32>>,
    interrupt: CancellationToken,
    telemetry_path: Option<PathBuf>,
) {
    let stop_poller = CancellationToken::new();
    let poller = telemetry_path.clone().map(|path| {
        tokio::spawn(poll_telemetry(
            inner.clone(),
            path,
            stop_poller.clone(),
            interrupt.clone(),
        ))
    });

    let mut buf = vec![0u8; READ_CHUNK];
    let mut interrupted = loop {
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => break true,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break false,
                Ok(n) => inner.feed_turn(&interrupt, |p| p.feed(&buf[..n])),
                Err(e) => {
                    warn!(session_id = %inner.id, turn_id = %turn_id, error = %e, "Agent stdout read failed");
                    break false;
                }
            },
        }
    };

    let mut exit_code = None;
    if !interrupted {
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => interrupted = true,
            code = &mut exit => exit_code = code.ok().flatten(),
        }
    }

    stop_poller.cancel();
    if let Some(poller) = poller {
        let _ = poller.await;
    }

    if interrupted {
        kill.cancel();
        match tokio::time::timeout(inner.config.supervisor.interrupt_grace(), &mut exit).await {
            Ok(code) => debug!(turn_id = %turn_id, exit_code = ?code.ok().flatten(), "Interrupted agent exited"),
            Err(_) => warn!(session_id = %inner.id, turn_id = %turn_id, "Agent did not exit within grace period"),
        }
    } else {
        inner.feed_turn(&interrupt, |p| p.finish(exit_code));
        info!(session_id = %inner.id, turn_id = %turn_id, exit_code = ?exit_code, "Turn finished");
    }

    if let Some(path) = telemetry_path {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "Telemetry file not removed");
        }
    }

    {
        let mut active = lock(&inner.active);
        if active.as_ref().is_some_and(|a| a.turn_id == turn_id) {
            *active = None;
        }
    }
    if !interrupted {
        let next = lock(&inner.supervisor).complete(&turn_id);
        start_next(&inner, next);
    }
}

async fn poll_telemetry(
    inner: Arc<Inner>,
    path: PathBuf,
    stop: CancellationToken,
    interrupt: CancellationToken,
) {
    let mut tail = TelemetryTail::new(path);
    let mut ticker = tokio::time::interval(inner.config.telemetry.poll_interval());
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => read_telemetry(&inner, &mut tail, &interrupt),
        }
    }
    // whatever landed between the last tick and process exit
    if !interrupt.is_cancelled() {
        read_telemetry(&inner, &mut tail, &interrupt);
    }
}

fn read_telemetry(inner: &Inner, tail: &mut TelemetryTail, interrupt: &CancellationToken) {
    match tail.read_new() {
        Ok(Some(text)) => inner.feed_turn(interrupt, |p| p.ingest_telemetry(&text)),
        Ok(None) => {}
        Err(e) => debug!(path = %tail.path().display(), error = %e, "Telemetry poll failed"),
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
    log: Arc<Mutex<SessionEventLog>>,
    events: broadcast::Sender<Event>,
    store: Option<CheckpointStore>,
    keep: usize,
    session_id: String,
) {
    let persister = store.map(|store| {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_persister(rx, Arc::new(store), keep, session_id.clone()));
        tx
    });

    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Event(event) => {
                if let Some(persister) = &persister {
                    if touches_checkpoints(&event) {
                        let _ = persister.send(PersistMsg::Event(event.clone()));
                    }
                }
                let outcome = lock(&log).append(event.clone());
                if outcome != AppendOutcome::Discarded {
                    let _ = events.send(event);
                }
            }
            WriterMsg::Seal { turn_id } => {
                let sealed = lock(&log).seal_streaming();
                if sealed > 0 {
                    debug!(session_id = %session_id, turn_id = %turn_id, sealed, "Sealed streaming messages");
                }
            }
            WriterMsg::Clear => {
                lock(&log).clear();
                if let Some(persister) = &persister {
                    let _ = persister.send(PersistMsg::Clear);
                }
            }
            WriterMsg::Flush(done) => match &persister {
                // the persister answers once it has caught up too
                Some(persister) => {
                    if let Err(mpsc::error::SendError(PersistMsg::Flush(done))) = persister.send(PersistMsg::Flush(done)) {
                        let _ = done.send(());
                    }
                }
                None => {
                    let _ = done.send(());
                }
            },
        }
    }
    debug!(session_id = %session_id, "Session writer stopped");
}

fn touches_checkpoints(event: &Event) -> bool {
    matches!(
        event,
        Event::CheckpointCreate { .. } | Event::ToolOutput { done: true, .. }
    )
}

/// Writes checkpoints in arrival order, each on the blocking pool.
async fn run_persister(
    mut rx: mpsc::UnboundedReceiver<PersistMsg>,
    store: Arc<CheckpointStore>,
    keep: usize,
    session_id: String,
) {
    // tool id -> persisted checkpoint awaiting its post-tool capture
    let mut awaiting_capture: HashMap<String, String> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            PersistMsg::Event(event) => {
                let store = store.clone();
                let mut pending = std::mem::take(&mut awaiting_capture);
                let job = tokio::task::spawn_blocking(move || {
                    persist_checkpoint(&store, &event, &mut pending, keep);
                    pending
                });
                match job.await {
                    Ok(pending) => awaiting_capture = pending,
                    Err(e) => warn!(session_id = %session_id, error = %e, "Checkpoint persistence task failed"),
                }
            }
            PersistMsg::Clear => awaiting_capture.clear(),
            PersistMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(session_id = %session_id, "Checkpoint persister stopped");
}
fn persist_checkpoint(
    store: &CheckpointStore,
    event: &Event,
    awaiting_capture: &mut HashMap<String, String>,
    keep: usize,
) {
    match event {
        Event::CheckpointCreate {
            id,
            trigger,
            tool_id,
            file_snapshots,
            ..
        } => match store.save(id, file_snapshots, Some(trigger)) {
            Ok(_) => {
                if let Some(tool_id) = tool_id {
                    awaiting_capture.insert(tool_id.clone(), id.clone());
                }
                if let Err(e) = store.clean_old(keep) {
                    warn!(error = %e, "Failed to prune old checkpoints");
                }
            }
            Err(e) => warn!(checkpoint_id = %id, error = %e, "Failed to persist checkpoint"),
        },
        Event::ToolOutput { id, done: true, .. } => {
            if let Some(checkpoint_id) = awaiting_capture.remove(id) {
                if let Err(e) = store.capture_current(&checkpoint_id) {
                    debug!(checkpoint_id = %checkpoint_id, error = %e, "Post-tool capture failed");
                }
            }
        }
        _ => {}
    }
}
