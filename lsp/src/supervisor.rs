//! Process supervisor: owns one language server child and its transport.
//!
//! Each spawn bumps a generation counter. The writer, reader, stderr and exit
//! tasks capture the generation they were started for and do nothing once the
//! supervisor has moved on, so a killed child can never act on behalf of its
//! replacement.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameEvent, FrameParser, FrameWriter, WriteError};
use crate::error::{LspError, LspErrorKind};
use crate::metrics::RequestMetrics;
use crate::protocol::{self, CapabilityMask, IncomingFrame, Notification, Request};
use crate::types::{CommandSpec, LifecycleEvent, SupervisorOptions};

const WRITER_CHANNEL_CAPACITY: usize = 64;

const READ_CHUNK_BYTES: usize = 16 * 1024;

enum WriterCommand {
    Send(Value),
    /// Acknowledged once the frame has been flushed to the child's stdin.
    SendFlushed(Value, oneshot::Sender<()>),
    Shutdown,
}

/// Receives lifecycle events and raw stderr lines.
pub trait LifecycleObserver: Send + Sync {
    fn on_lifecycle(&self, event: &LifecycleEvent);

    fn on_stderr(&self, _line: &str) {}
}

/// Receives server-initiated notifications such as `publishDiagnostics`.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, method: &str, params: Option<&Value>);
}

/// May drop (`None`) or rewrite a stderr line before it is logged.
pub type StderrFilter = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Handles to a freshly spawned child.
///
/// Sending on or dropping `kill` terminates the child; `exited` resolves with
/// the exit code once it is gone.
pub struct SpawnedChild {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub exited: oneshot::Receiver<Option<i32>>,
    pub kill: oneshot::Sender<()>,
}

/// Creates server processes.
pub trait Launcher: Send + Sync {
    fn spawn(&self, command: &CommandSpec) -> io::Result<SpawnedChild>;
}

/// Spawns real processes with piped stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

impl Launcher for ProcessLauncher {
    fn spawn(&self, command: &CommandSpec) -> io::Result<SpawnedChild> {
        let mut cmd = if command.shell {
            let line = std::iter::once(command.cmd.as_str())
                .chain(command.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            shell_command(&line)
        } else {
            let resolved = which::which(&command.cmd).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found in PATH: {e}", command.cmd),
                )
            })?;
            let mut cmd = Command::new(resolved);
            cmd.args(&command.args);
            cmd
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd.spawn()?;
        let missing = |what: &str| io::Error::other(format!("no {what} from child"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let (exited_tx, exited_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await.ok()
                }
            };
            let _ = exited_tx.send(status.and_then(|s| s.code()));
        });

        Ok(SpawnedChild {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            exited: exited_rx,
            kill: kill_tx,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Crashed,
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    #[must_use]
    pub fn cancel(mut self, cancel: &CancellationToken) -> Self {
        self.cancel = Some(cancel.clone());
        self
    }
}

struct LiveChild {
    generation: u64,
    pid: Option<u32>,
    writer_tx: mpsc::Sender<WriterCommand>,
    writer_closed: Arc<AtomicBool>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
    /// Set once shutdown was requested; the exit is then expected.
    stopping: bool,
}

impl LiveChild {
    fn is_usable(&self) -> bool {
        !self.writer_closed.load(Ordering::Acquire) && !*self.exited.borrow()
    }
}

struct PendingRequest {
    method: String,
    generation: u64,
    tx: oneshot::Sender<Result<Value, LspError>>,
}

struct State {
    phase: SupervisorState,
    child: Option<LiveChild>,
    pending: HashMap<u64, PendingRequest>,
    restart_attempts: u32,
    next_start_at: Option<Instant>,
    capabilities: Option<CapabilityMask>,
}

struct Inner {
    name: String,
    command: CommandSpec,
    options: SupervisorOptions,
    launcher: Arc<dyn Launcher>,
    observer: Option<Arc<dyn LifecycleObserver>>,
    sink: RwLock<Option<Arc<dyn NotificationSink>>>,
    stderr_filter: Option<StderrFilter>,
    state: Mutex<State>,
    next_id: AtomicU64,
    generation: AtomicU64,
    spawn_count: AtomicU64,
    metrics: RequestMetrics,
}

pub struct SupervisorBuilder {
    name: String,
    command: CommandSpec,
    launcher: Arc<dyn Launcher>,
    options: SupervisorOptions,
    observer: Option<Arc<dyn LifecycleObserver>>,
    stderr_filter: Option<StderrFilter>,
}

impl SupervisorBuilder {
    #[must_use]
    pub fn options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn stderr_filter(mut self, filter: StderrFilter) -> Self {
        self.stderr_filter = Some(filter);
        self
    }

    #[must_use]
    pub fn build(self) -> Supervisor {
        Supervisor {
            inner: Arc::new(Inner {
                name: self.name,
                command: self.command,
                options: self.options,
                launcher: self.launcher,
                observer: self.observer,
                sink: RwLock::new(None),
                stderr_filter: self.stderr_filter,
                state: Mutex::new(State {
                    phase: SupervisorState::Stopped,
                    child: None,
                    pending: HashMap::new(),
                    restart_attempts: 0,
                    next_start_at: None,
                    capabilities: None,
                }),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                spawn_count: AtomicU64::new(0),
                metrics: RequestMetrics::default(),
            }),
        }
    }
}

/// Cheap to clone; clones share the child.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn builder(
        name: impl Into<String>,
        command: CommandSpec,
        launcher: Arc<dyn Launcher>,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            name: name.into(),
            command,
            launcher,
            options: SupervisorOptions::default(),
            observer: None,
            stderr_filter: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.inner.lock().phase
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Successful spawns over this supervisor's lifetime.
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.inner.spawn_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().child.as_ref().and_then(|c| c.pid)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .child
            .as_ref()
            .is_some_and(LiveChild::is_usable)
    }

    #[must_use]
    pub fn capabilities(&self) -> Option<CapabilityMask> {
        self.inner.lock().capabilities
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    #[must_use]
    pub fn metrics(&self) -> &RequestMetrics {
        &self.inner.metrics
    }

    pub fn set_notification_sink(&self, sink: Option<Arc<dyn NotificationSink>>) {
        *self
            .inner
            .sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Spawn the child unless a usable one is already running.
    ///
    /// Returns the live generation. Fails fast while a restart backoff is
    /// pending.
    pub fn start(&self) -> Result<u64, LspError> {
        Inner::start(&self.inner)
    }

    /// Kill the current child and spawn a fresh one.
    pub fn restart(&self) -> Result<u64, LspError> {
        self.kill();
        self.start()
    }

    /// Send a request, starting the child first if needed.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, LspError> {
        self.start()?;
        self.inner.request_live(method, params, options).await
    }

    /// Fire-and-forget. Never starts a child.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        self.inner.notify_live(method, params).await
    }

    /// Run the `initialize`/`initialized` handshake.
    pub async fn initialize(
        &self,
        root_uri: &str,
        initialization_options: Option<&Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<CapabilityMask, LspError> {
        let params = protocol::initialize_params(root_uri, initialization_options);
        let options = RequestOptions {
            timeout: Some(self.inner.options.initialize_timeout),
            cancel: cancel.cloned(),
        };
        let result = self.request("initialize", Some(params), options).await?;
        let capabilities = CapabilityMask::from_initialize_result(&result);
        self.notify("initialized", Some(serde_json::json!({}))).await?;

        let mut state = self.inner.lock();
        state.capabilities = Some(capabilities);
        state.phase = SupervisorState::Ready;
        state.restart_attempts = 0;
        state.next_start_at = None;
        drop(state);
        tracing::info!(cmd = %self.inner.name, generation = self.generation(), "language server initialized");
        Ok(capabilities)
    }

    /// Graceful stop: `shutdown`, `exit`, then force-kill after the grace
    /// window. Never spawns a replacement.
    pub async fn shutdown_and_exit(&self) {
        let exited = {
            let mut state = self.inner.lock();
            let Some(child) = state.child.as_mut() else {
                return;
            };
            child.stopping = true;
            child.exited.clone()
        };

        let shutdown = RequestOptions::with_timeout(self.inner.options.shutdown_timeout);
        if let Err(err) = self.inner.request_live("shutdown", None, shutdown).await {
            tracing::debug!(cmd = %self.inner.name, "shutdown request failed: {err}");
        }
        let _ = self.notify("exit", None).await;

        let mut exited = exited;
        let wait = async move {
            let _ = exited.wait_for(|done| *done).await;
        };
        let exited_in_time = tokio::time::timeout(self.inner.options.kill_grace, wait)
            .await
            .is_ok();
        if !exited_in_time {
            tracing::debug!(cmd = %self.inner.name, "language server did not exit in time, killing");
            self.kill();
        }
    }

    /// Terminate the child now. Pending requests fail with
    /// [`LspErrorKind::TransportClosed`]; no restart backoff is scheduled.
    pub fn kill(&self) {
        let (child, pending) = {
            let mut state = self.inner.lock();
            state.phase = SupervisorState::Stopped;
            (state.child.take(), std::mem::take(&mut state.pending))
        };
        reject_all(pending, || LspError::closed("language server was killed"));
        if let Some(child) = child {
            self.inner.terminate(child);
        }
    }
}

fn reject_all(pending: HashMap<u64, PendingRequest>, err: impl Fn() -> LspError) {
    for (_, request) in pending {
        let _ = request.tx.send(Err(err()));
    }
}

/// Removes a pending entry when the request future finishes or is dropped.
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.lock().pending.remove(&self.id);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: &LifecycleEvent) {
        if let Some(observer) = &self.observer {
            observer.on_lifecycle(event);
        }
    }

    fn is_current(state: &State, generation: u64) -> bool {
        state
            .child
            .as_ref()
            .is_some_and(|child| child.generation == generation)
    }

    fn schedule_backoff(&self, state: &mut State) {
        let exponent = state.restart_attempts.min(16);
        let delay = self
            .options
            .backoff_base
            .saturating_mul(1 << exponent)
            .min(self.options.backoff_max);
        state.restart_attempts = state.restart_attempts.saturating_add(1);
        state.next_start_at = Some(Instant::now() + delay);
    }

    fn terminate(&self, mut child: LiveChild) {
        if let Some(kill) = child.kill.take() {
            let _ = kill.send(());
        }
        let _ = child.writer_tx.try_send(WriterCommand::Shutdown);
        self.emit(&LifecycleEvent::Kill {
            generation: child.generation,
        });
    }

    fn start(this: &Arc<Self>) -> Result<u64, LspError> {
        let mut state = this.lock();
        if let Some(child) = &state.child
            && child.is_usable()
        {
            return Ok(child.generation);
        }
        if let Some(stale) = state.child.take() {
            let pending = std::mem::take(&mut state.pending);
            drop(state);
            reject_all(pending, || LspError::closed("language server connection closed"));
            this.terminate(stale);
            state = this.lock();
        }

        let now = Instant::now();
        if let Some(at) = state.next_start_at
            && now < at
        {
            return Err(LspError::new(
                LspErrorKind::BackoffActive,
                format!("{} restart backoff active", this.name),
            )
            .with_retry_after(at - now));
        }

        let generation = this.generation.fetch_add(1, Ordering::AcqRel) + 1;
        state.phase = SupervisorState::Starting;
        let spawned = match this.launcher.spawn(&this.command) {
            Ok(spawned) => spawned,
            Err(err) => {
                state.phase = SupervisorState::Crashed;
                this.schedule_backoff(&mut state);
                drop(state);
                let message = format!("spawning {}: {err}", this.command.cmd);
                tracing::warn!(cmd = %this.name, generation, "{message}");
                this.emit(&LifecycleEvent::Error {
                    generation,
                    message: message.clone(),
                });
                return Err(LspError::new(LspErrorKind::Spawn, message));
            }
        };
        this.spawn_count.fetch_add(1, Ordering::AcqRel);

        let SpawnedChild {
            pid,
            stdin,
            stdout,
            stderr,
            exited,
            kill,
        } = spawned;
        let weak = Arc::downgrade(this);
        let writer_closed = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (exited_tx, exited_rx) = watch::channel(false);

        spawn_writer(
            weak.clone(),
            generation,
            stdin,
            writer_rx,
            Arc::clone(&writer_closed),
        );
        spawn_reader(
            weak.clone(),
            generation,
            stdout,
            writer_tx.clone(),
            this.options.frame_limits,
        );
        if let Some(stderr) = stderr {
            spawn_stderr(weak.clone(), generation, stderr);
        }
        spawn_exit_watcher(weak, generation, exited, exited_tx);

        state.child = Some(LiveChild {
            generation,
            pid,
            writer_tx,
            writer_closed,
            kill: Some(kill),
            exited: exited_rx,
            stopping: false,
        });
        drop(state);

        tracing::info!(cmd = %this.name, generation, pid, "language server started");
        this.emit(&LifecycleEvent::Start { generation, pid });
        Ok(generation)
    }

    async fn request_live(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, LspError> {
        let timeout = options.timeout.unwrap_or(self.options.request_timeout);
        if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(LspError::cancelled());
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = oneshot::channel();
        let writer_tx = {
            let mut state = self.lock();
            let Some(child) = state.child.as_ref() else {
                return Err(LspError::closed(format!(
                    "{method}: language server is not running"
                )));
            };
            let writer_tx = child.writer_tx.clone();
            let generation = child.generation;
            state.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    generation,
                    tx,
                },
            );
            writer_tx
        };
        let _slot = PendingSlot { inner: self, id };

        let started = Instant::now();
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| LspError::new(LspErrorKind::Transport, format!("serializing {method}: {e}")))?;
        if writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            return Err(LspError::closed(format!("{method}: writer closed")));
        }

        let cancelled = async {
            match &options.cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, rx) => match result {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(LspError::closed(format!("{method}: connection closed"))),
                Err(_) => {
                    send_cancel(&writer_tx, id);
                    Err(LspError::timeout(method, timeout))
                }
            },
            () = cancelled => {
                send_cancel(&writer_tx, id);
                Err(LspError::cancelled())
            }
        };
        self.metrics
            .record(method, started.elapsed(), outcome.as_ref().map(|_| ()));
        outcome
    }

    async fn notify_live(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        let writer_tx = self
            .lock()
            .child
            .as_ref()
            .map(|child| child.writer_tx.clone())
            .ok_or_else(|| LspError::closed(format!("{method}: language server is not running")))?;
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| LspError::new(LspErrorKind::Transport, format!("serializing {method}: {e}")))?;
        let (flushed_tx, flushed_rx) = oneshot::channel();
        writer_tx
            .send(WriterCommand::SendFlushed(frame, flushed_tx))
            .await
            .map_err(|_| LspError::closed(format!("{method}: writer closed")))?;
        flushed_rx
            .await
            .map_err(|_| LspError::closed(format!("{method}: writer closed before flushing")))
    }

    async fn dispatch(&self, generation: u64, frame: &Value, writer_tx: &mpsc::Sender<WriterCommand>) {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::trace!(cmd = %self.name, "ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let request = {
                    let mut state = self.lock();
                    match state.pending.get(&id) {
                        Some(p) if p.generation == generation => state.pending.remove(&id),
                        _ => None,
                    }
                };
                match request {
                    Some(request) => {
                        tracing::trace!(cmd = %self.name, id, method = %request.method, "response");
                        let _ = request.tx.send(protocol::response_result(body));
                    }
                    None => tracing::trace!(cmd = %self.name, id, "response for unknown request"),
                }
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                tracing::debug!(cmd = %self.name, %method, "answering server request");
                let reply = protocol::server_request_reply(&id, &method, params.as_ref());
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
            IncomingFrame::Notification { method, params } => {
                let sink = self
                    .sink
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match sink {
                    Some(sink) => sink.notify(&method, params.as_ref()),
                    None => tracing::trace!(cmd = %self.name, %method, "ignoring notification"),
                }
            }
        }
    }

    fn on_transport_error(&self, generation: u64, reason: &str) {
        let (child, pending) = {
            let mut state = self.lock();
            if !Self::is_current(&state, generation) {
                return;
            }
            state.phase = SupervisorState::Crashed;
            self.schedule_backoff(&mut state);
            (state.child.take(), std::mem::take(&mut state.pending))
        };
        tracing::warn!(cmd = %self.name, generation, "transport failure: {reason}");
        let count = pending.len();
        reject_all(pending, || {
            LspError::new(LspErrorKind::Transport, format!("transport failure: {reason}"))
        });
        if count > 0 {
            self.emit(&LifecycleEvent::Reap {
                generation,
                pending: count,
            });
        }
        if let Some(child) = child {
            self.terminate(child);
        }
    }

    fn on_writer_closed(&self, generation: u64) {
        let (child, pending) = {
            let mut state = self.lock();
            if !Self::is_current(&state, generation) {
                return;
            }
            if state.child.as_ref().is_some_and(|c| c.stopping) {
                // Expected during shutdown; the exit watcher finishes up.
                return;
            }
            state.phase = SupervisorState::Crashed;
            self.schedule_backoff(&mut state);
            (state.child.take(), std::mem::take(&mut state.pending))
        };
        let count = pending.len();
        tracing::warn!(cmd = %self.name, generation, pending = count, "language server input closed");
        reject_all(pending, || LspError::closed("language server input closed"));
        self.emit(&LifecycleEvent::Reap {
            generation,
            pending: count,
        });
        if let Some(child) = child {
            self.terminate(child);
        }
    }

    fn on_stderr_line(&self, line: &str) {
        if let Some(observer) = &self.observer {
            observer.on_stderr(line);
        }
        let line = match &self.stderr_filter {
            Some(filter) => filter(line),
            None => Some(line.to_string()),
        };
        if let Some(line) = line {
            tracing::debug!(cmd = %self.name, "stderr: {line}");
        }
    }

    fn on_exit(&self, generation: u64, code: Option<i32>) {
        let (expected, pending) = {
            let mut state = self.lock();
            if !Self::is_current(&state, generation) {
                return;
            }
            let expected = state.child.take().is_some_and(|child| child.stopping);
            if expected {
                state.phase = SupervisorState::Stopped;
            } else {
                state.phase = SupervisorState::Crashed;
                self.schedule_backoff(&mut state);
            }
            (expected, std::mem::take(&mut state.pending))
        };
        if expected {
            tracing::info!(cmd = %self.name, generation, code, "language server exited");
        } else {
            tracing::warn!(cmd = %self.name, generation, code, "language server exited unexpectedly");
        }
        reject_all(pending, || LspError::closed("language server exited"));
        self.emit(&LifecycleEvent::Exit {
            generation,
            code,
            expected,
        });
    }
}

fn send_cancel(writer_tx: &mpsc::Sender<WriterCommand>, id: u64) {
    let notification = Notification::new("$/cancelRequest", Some(protocol::cancel_params(id)));
    if let Ok(frame) = serde_json::to_value(notification) {
        let _ = writer_tx.try_send(WriterCommand::Send(frame));
    }
}

fn spawn_writer(
    inner: Weak<Inner>,
    generation: u64,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::Receiver<WriterCommand>,
    closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut writer = FrameWriter::new(stdin);
        while let Some(cmd) = rx.recv().await {
            let (frame, flushed) = match cmd {
                WriterCommand::Send(frame) => (frame, None),
                WriterCommand::SendFlushed(frame, flushed) => (frame, Some(flushed)),
                WriterCommand::Shutdown => return,
            };
            match writer.write_frame(&frame).await {
                Ok(()) => {
                    if let Some(flushed) = flushed {
                        let _ = flushed.send(());
                    }
                }
                Err(WriteError::Serialize(e)) => {
                    tracing::warn!(generation, "dropping unserializable frame: {e}");
                }
                Err(WriteError::Closed) => break,
                Err(WriteError::Io(e)) => {
                    tracing::warn!(generation, "LSP write error: {e}");
                    break;
                }
            }
        }
        closed.store(true, Ordering::Release);
        if let Some(inner) = inner.upgrade() {
            inner.on_writer_closed(generation);
        }
    });
}

fn spawn_reader(
    inner: Weak<Inner>,
    generation: u64,
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    writer_tx: mpsc::Sender<WriterCommand>,
    limits: crate::codec::FrameLimits,
) {
    tokio::spawn(async move {
        let mut parser = FrameParser::new(limits);
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(generation, "LSP read error: {e}");
                    return;
                }
            };
            for event in parser.push(&buf[..n]) {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match event {
                    FrameEvent::Message(frame) => inner.dispatch(generation, &frame, &writer_tx).await,
                    FrameEvent::Error(err) => {
                        inner.on_transport_error(generation, &err.to_string());
                        return;
                    }
                }
            }
        }
    });
}

fn spawn_stderr(inner: Weak<Inner>, generation: u64, stderr: Box<dyn AsyncRead + Send + Unpin>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::Acquire) != generation {
                return;
            }
            inner.on_stderr_line(&line);
        }
    });
}

fn spawn_exit_watcher(
    inner: Weak<Inner>,
    generation: u64,
    exited: oneshot::Receiver<Option<i32>>,
    exited_tx: watch::Sender<bool>,
) {
    tokio::spawn(async move {
        let code = exited.await.ok().flatten();
        if let Some(inner) = inner.upgrade() {
            inner.on_exit(generation, code);
        }
        let _ = exited_tx.send(true);
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::testing::{StubLauncher, StubReply, StubScript};

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<LifecycleEvent>>);

    impl LifecycleObserver for Recorder {
        fn on_lifecycle(&self, event: &LifecycleEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<LifecycleEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    fn supervisor(launcher: &Arc<StubLauncher>) -> (Supervisor, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let supervisor = Supervisor::builder("stub", CommandSpec::new("stub-ls"), launcher.clone())
            .options(SupervisorOptions {
                kill_grace: Duration::from_millis(200),
                ..SupervisorOptions::default()
            })
            .observer(recorder.clone())
            .build();
        (supervisor, recorder)
    }

    #[tokio::test]
    async fn initialize_reads_capabilities() {
        let launcher = StubLauncher::new(StubScript::default());
        let (supervisor, _) = supervisor(&launcher);
        let caps = supervisor
            .initialize("file:///repo", None, None)
            .await
            .unwrap();
        assert!(caps.hover);
        assert!(caps.document_symbol);
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert_eq!(launcher.notification_count("initialized"), 1);
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let launcher = StubLauncher::new(StubScript::default());
        let (supervisor, _) = supervisor(&launcher);
        let first = supervisor.start().unwrap();
        let second = supervisor.start().unwrap();
        assert_eq!(first, second);
        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test]
    async fn two_restarts_spawn_exactly_two_processes() {
        let launcher = StubLauncher::new(StubScript::default());
        let (supervisor, recorder) = supervisor(&launcher);
        supervisor.start().unwrap();
        supervisor.kill();
        supervisor.start().unwrap();
        // Let the killed generation's exit watcher run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(launcher.spawn_count(), 2);
        assert_eq!(supervisor.generation(), 2);
        assert!(supervisor.is_running());
        let exits = recorder
            .events()
            .iter()
            .filter(|e| matches!(e, LifecycleEvent::Exit { .. }))
            .count();
        assert_eq!(exits, 0, "stale generation must not report an exit");
    }

    #[tokio::test]
    async fn timeout_removes_pending_and_sends_cancel() {
        let launcher = StubLauncher::new(StubScript::default().reply("textDocument/hover", StubReply::Stall));
        let (supervisor, _) = supervisor(&launcher);
        supervisor.initialize("file:///repo", None, None).await.unwrap();

        let err = supervisor
            .request(
                "textDocument/hover",
                Some(serde_json::json!({})),
                RequestOptions::with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(err.is(LspErrorKind::Timeout));
        assert_eq!(supervisor.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(launcher.notification_count("$/cancelRequest"), 1);
        let hover = &supervisor.metrics().snapshot()["textDocument/hover"];
        assert_eq!(hover.timed_out, 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_request() {
        let launcher = StubLauncher::new(StubScript::default().reply("textDocument/hover", StubReply::Stall));
        let (supervisor, _) = supervisor(&launcher);
        supervisor.start().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = supervisor
            .request("textDocument/hover", None, RequestOptions::default().cancel(&cancel))
            .await
            .unwrap_err();
        assert!(err.is(LspErrorKind::Cancelled));
        assert_eq!(supervisor.pending_count(), 0);
    }

    #[tokio::test]
    async fn protocol_errors_are_tagged() {
        let launcher = StubLauncher::new(StubScript::default().reply(
            "textDocument/hover",
            StubReply::Error {
                code: -32603,
                message: "internal".into(),
            },
        ));
        let (supervisor, _) = supervisor(&launcher);
        let err = supervisor
            .request("textDocument/hover", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.is(LspErrorKind::Protocol));
        assert_eq!(err.code(), Some(-32603));
    }

    #[tokio::test]
    async fn crash_rejects_pending_and_schedules_backoff() {
        let launcher = StubLauncher::new(StubScript::default().crash_on("textDocument/hover"));
        let (supervisor, recorder) = supervisor(&launcher);
        supervisor.start().unwrap();
        let err = supervisor
            .request("textDocument/hover", None, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(err.kind().poisons_session(), "got {:?}", err.kind());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.state(), SupervisorState::Crashed);
        let restart = supervisor.start().unwrap_err();
        assert!(restart.is(LspErrorKind::BackoffActive));
        assert!(restart.retry_after().is_some());
        assert!(recorder.events().iter().any(|e| matches!(
            e,
            LifecycleEvent::Exit {
                expected: false,
                ..
            }
        )));
        assert_eq!(launcher.spawn_count(), 1);
    }

    #[tokio::test]
    async fn closed_input_rejects_pending_and_kills_once() {
        let launcher = StubLauncher::new(StubScript::default().close_input_on("textDocument/hover"));
        let recorder = Arc::new(Recorder::default());
        let supervisor = Supervisor::builder("stub", CommandSpec::new("stub-ls"), launcher.clone())
            .options(SupervisorOptions {
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(10),
                ..SupervisorOptions::default()
            })
            .observer(recorder.clone())
            .build();
        supervisor.start().unwrap();

        let in_flight = supervisor.clone();
        let hover = tokio::spawn(async move {
            in_flight
                .request("textDocument/hover", None, RequestOptions::default())
                .await
        });
        while launcher.request_count("textDocument/hover") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(supervisor.pending_count(), 1);

        // The next frame hits the closed pipe.
        let notify = supervisor.notify("textDocument/didClose", None).await.unwrap_err();
        assert!(notify.is(LspErrorKind::TransportClosed));
        let err = hover.await.unwrap().unwrap_err();
        assert!(err.is(LspErrorKind::TransportClosed), "got {:?}", err.kind());
        assert_eq!(supervisor.pending_count(), 0);
        assert_eq!(supervisor.state(), SupervisorState::Crashed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(supervisor.start().unwrap(), 2);
        assert_eq!(launcher.spawn_count(), 2);

        let events = recorder.events();
        assert!(events.contains(&LifecycleEvent::Reap {
            generation: 1,
            pending: 1
        }));
        let kills = events
            .iter()
            .filter(|e| **e == LifecycleEvent::Kill { generation: 1 })
            .count();
        assert_eq!(kills, 1);
        assert!(!events.iter().any(|e| matches!(e, LifecycleEvent::Exit { generation: 1, .. })));
    }

    #[tokio::test]
    async fn shutdown_and_exit_never_respawns() {
        let launcher = StubLauncher::new(StubScript::default());
        let (supervisor, recorder) = supervisor(&launcher);
        supervisor.initialize("file:///repo", None, None).await.unwrap();
        supervisor.shutdown_and_exit().await;
        // A second call with nothing running is a no-op.
        supervisor.shutdown_and_exit().await;

        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(launcher.request_count("shutdown"), 1);
        assert_eq!(launcher.notification_count("exit"), 1);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(recorder.events().iter().any(|e| matches!(
            e,
            LifecycleEvent::Exit { expected: true, .. }
        )));
    }

    #[tokio::test]
    async fn notify_does_not_start_a_child() {
        let launcher = StubLauncher::new(StubScript::default());
        let (supervisor, _) = supervisor(&launcher);
        let err = supervisor.notify("textDocument/didClose", None).await.unwrap_err();
        assert!(err.is(LspErrorKind::TransportClosed));
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn spawn_failure_emits_error_and_backs_off() {
        let launcher = StubLauncher::new(StubScript::default().fail_spawn());
        let (supervisor, recorder) = supervisor(&launcher);
        let err = supervisor.start().unwrap_err();
        assert!(err.is(LspErrorKind::Spawn));
        assert!(supervisor.start().unwrap_err().is(LspErrorKind::BackoffActive));
        assert!(matches!(recorder.events()[0], LifecycleEvent::Error { generation: 1, .. }));
    }

    #[tokio::test]
    async fn server_requests_are_answered() {
        let launcher = StubLauncher::new(StubScript::default().server_request(
            "workspace/configuration",
            serde_json::json!({"items": [{"section": "python"}]}),
        ));
        let (supervisor, _) = supervisor(&launcher);
        supervisor.initialize("file:///repo", None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let replies = launcher.client_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["result"], serde_json::json!([null]));
    }

    #[tokio::test]
    async fn stderr_lines_reach_the_observer() {
        #[derive(Default)]
        struct Lines(StdMutex<Vec<String>>);
        impl LifecycleObserver for Lines {
            fn on_lifecycle(&self, _event: &LifecycleEvent) {}
            fn on_stderr(&self, line: &str) {
                self.0.lock().unwrap().push(line.to_string());
            }
        }

        let launcher = StubLauncher::new(StubScript::default().stderr("EMFILE: too many open files"));
        let lines = Arc::new(Lines::default());
        let supervisor = Supervisor::builder("stub", CommandSpec::new("stub-ls"), launcher.clone())
            .observer(lines.clone())
            .stderr_filter(Arc::new(|_| None))
            .build();
        supervisor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*lines.0.lock().unwrap(), vec!["EMFILE: too many open files".to_string()]);
    }
}
