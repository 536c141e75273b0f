//! Supervisor for the single engine process.
//!
//! At most one run is active at a time. A run goes through an optional
//! overwrite decision, spawns the engine with piped output, relays every
//! output line (plus progress facts from stderr) as [`RunEvent`]s and ends
//! with exactly one terminal event.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{LogStream, OverwriteDecision, RunEvent, RunEventSender, RunState};
use super::progress::{ProgressExtractor, ProgressFact};
use super::tokenizer::CommandSpec;
use crate::error::{CancelError, DecisionError, RunFailure, StartError};

/// Read size for the output pumps.
const OUTPUT_CHUNK_SIZE: usize = 4096;

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
struct Slot {
    state: RunState,
    run_id: Option<Uuid>,
    decision_tx: Option<oneshot::Sender<OverwriteDecision>>,
    kill_tx: Option<oneshot::Sender<()>>,
    cancel_requested: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            run_id: None,
            decision_tx: None,
            kill_tx: None,
            cancel_requested: false,
        }
    }
}

/// State shared between the supervisor handle and its run task.
///
/// Events are sent while the lock is held so a new run's `Started` can never
/// overtake the previous run's terminal event.
#[derive(Debug, Clone)]
struct Shared {
    slot: Arc<Mutex<Slot>>,
    events: RunEventSender,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A poisoned slot only means a panicking reader; the data is still usable.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RunEvent) {
        if self.events.send(event).is_err() {
            debug!("Run event receiver dropped");
        }
    }

    /// Records the terminal state and sends the matching terminal event.
    fn finish(&self, state: RunState) {
        let event = match &state {
            RunState::Completed => RunEvent::Completed,
            RunState::Failed(failure) => RunEvent::Failed(failure.clone()),
            _ => RunEvent::Cancelled,
        };

        let mut slot = self.lock();
        slot.state = state;
        slot.decision_tx = None;
        slot.kill_tx = None;
        self.emit(event);
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the engine process slot.
///
/// `start()` spawns a Tokio task, so it must be called from within a runtime.
#[derive(Debug)]
pub struct Supervisor {
    shared: Shared,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(events: RunEventSender) -> Self {
        Self {
            shared: Shared {
                slot: Arc::new(Mutex::new(Slot::default())),
                events,
            },
            task: Mutex::new(None),
        }
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        self.shared.lock().state.clone()
    }

    /// Identifier of the most recently accepted run.
    pub fn current_run(&self) -> Option<Uuid> {
        self.shared.lock().run_id
    }

    /// Starts a run of `binary` with the arguments in `raw_command`.
    ///
    /// Refused with no side effects while another run is active or when the
    /// command has no arguments.
    pub fn start(
        &self,
        raw_command: &str,
        binary: impl Into<PathBuf>,
    ) -> Result<Uuid, StartError> {
        let spec = CommandSpec::parse(raw_command);
        let binary = binary.into();

        let mut slot = self.shared.lock();
        if slot.state.is_active() {
            debug!(state = ?slot.state, "Rejecting start, run already active");
            return Err(StartError::Busy);
        }
        if spec.is_empty() {
            return Err(StartError::EmptyCommand);
        }

        let run_id = Uuid::new_v4();
        let collision = spec
            .output_path()
            .filter(|path| path.exists())
            .map(Path::to_path_buf);

        slot.run_id = Some(run_id);
        slot.cancel_requested = false;
        slot.kill_tx = None;

        info!(%run_id, args = ?spec.args(), "Starting engine run");
        self.shared.emit(RunEvent::Started {
            run_id,
            args: spec.args().to_vec(),
        });

        let decision_rx = match collision {
            Some(path) => {
                let (tx, rx) = oneshot::channel();
                slot.decision_tx = Some(tx);
                slot.state = RunState::AwaitingDecision;
                info!(path = %path.display(), "Output file exists, awaiting decision");
                self.shared.emit(RunEvent::CollisionDetected { path });
                Some(rx)
            }
            None => {
                slot.decision_tx = None;
                slot.state = RunState::Spawning;
                None
            }
        };
        drop(slot);

        let shared = self.shared.clone();
        let handle = tokio::spawn(run_task(shared, spec, binary, decision_rx));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(run_id)
    }

    /// Answers a pending `CollisionDetected`.
    pub fn resolve_collision(&self, decision: OverwriteDecision) -> Result<(), DecisionError> {
        let mut slot = self.shared.lock();
        if slot.state != RunState::AwaitingDecision {
            return Err(DecisionError::NoPendingDecision);
        }
        let tx = slot
            .decision_tx
            .take()
            .ok_or(DecisionError::NoPendingDecision)?;

        info!(?decision, "Overwrite decision received");
        if decision == OverwriteDecision::Proceed {
            slot.state = RunState::Spawning;
        }
        // The run task owns the receiver until it finishes.
        let _ = tx.send(decision);
        Ok(())
    }

    /// Requests termination of the running engine.
    ///
    /// The terminal `Cancelled` event follows once the process has exited.
    pub fn cancel(&self) -> Result<(), CancelError> {
        let mut slot = self.shared.lock();
        if slot.state != RunState::Running {
            return Err(CancelError::NotRunning);
        }

        slot.cancel_requested = true;
        if let Some(tx) = slot.kill_tx.take() {
            info!("Cancelling engine run");
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Waits for the current run task to finish.
    pub async fn wait(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Run task panicked");
            }
        }
    }
}

// =============================================================================
// Run Task
// =============================================================================

async fn run_task(
    shared: Shared,
    spec: CommandSpec,
    binary: PathBuf,
    decision_rx: Option<oneshot::Receiver<OverwriteDecision>>,
) {
    let spec = match decision_rx {
        None => spec,
        Some(rx) => match rx.await {
            Ok(OverwriteDecision::Proceed) => spec.with_overwrite(),
            Ok(OverwriteDecision::Abort) | Err(_) => {
                info!("Overwrite declined, run cancelled");
                shared.finish(RunState::Cancelled);
                return;
            }
        },
    };

    if let Err(failure) = check_binary(&binary) {
        warn!(binary = %binary.display(), "Engine binary unavailable");
        shared.finish(RunState::Failed(failure));
        return;
    }

    let mut process = match ProcessHandle::spawn(&binary, spec.args()) {
        Ok(process) => process,
        Err(e) => {
            error!(error = %e, "Failed to spawn engine");
            shared.finish(RunState::Failed(RunFailure::Spawn(e.to_string())));
            return;
        }
    };

    let (kill_tx, kill_rx) = oneshot::channel();
    {
        let mut slot = shared.lock();
        slot.kill_tx = Some(kill_tx);
        slot.state = RunState::Running;
    }
    debug!(pid = ?process.id(), "Engine running");

    let (stdout, stderr) = process.take_output();
    let stdout_task =
        stdout.map(|out| tokio::spawn(pump_output(out, LogStream::Stdout, shared.clone())));
    let stderr_task =
        stderr.map(|err| tokio::spawn(pump_output(err, LogStream::Stderr, shared.clone())));

    let status = process.wait_for_exit(kill_rx).await;

    // Readers end at EOF, once every process holding the pipes has exited.
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        if let Err(e) = task.await {
            error!(error = %e, "Output reader panicked");
        }
    }

    let cancel_requested = shared.lock().cancel_requested;
    let outcome = match status {
        _ if cancel_requested => RunState::Cancelled,
        Ok(status) if status.success() => RunState::Completed,
        Ok(status) => match status.code() {
            Some(code) => RunState::Failed(RunFailure::ExitCode(code)),
            None => RunState::Failed(RunFailure::Terminated),
        },
        Err(e) => RunState::Failed(RunFailure::Spawn(format!(
            "failed to wait for process: {}",
            e
        ))),
    };

    info!(outcome = ?outcome, "Engine run finished");
    shared.finish(outcome);
}

// =============================================================================
// Process Handle
// =============================================================================

/// The live engine process, owned by exactly one run task.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
}

impl ProcessHandle {
    /// Spawns the engine. On Unix it leads its own process group so a cancel
    /// reaches any helpers it started.
    fn spawn(binary: &Path, args: &[String]) -> std::io::Result<Self> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        Ok(Self { child })
    }

    /// OS process id, while the process is alive.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }

    /// Waits for the process to exit, killing it first if `kill_rx` fires.
    async fn wait_for_exit(
        mut self,
        mut kill_rx: oneshot::Receiver<()>,
    ) -> std::io::Result<ExitStatus> {
        tokio::select! {
            status = self.child.wait() => status,
            Ok(()) = &mut kill_rx => {
                self.kill();
                self.child.wait().await
            }
        }
    }

    /// Kills the process group, falling back to the direct child.
    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: kill(2) only sends a signal; the group was created at spawn.
            if unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) } == 0 {
                return;
            }
            debug!(pid, "Process group kill failed, killing child only");
        }

        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "Failed to kill engine process");
        }
    }
}

/// Checks that `binary` is a file we can execute.
fn check_binary(binary: &Path) -> Result<(), RunFailure> {
    let unavailable = || RunFailure::BinaryUnavailable(binary.to_path_buf());
    let metadata = std::fs::metadata(binary).map_err(|_| unavailable())?;

    if !metadata.is_file() {
        return Err(unavailable());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(unavailable());
        }
    }

    Ok(())
}

// =============================================================================
// Output Pumps
// =============================================================================

/// Reads `reader` to EOF as lines and relays them.
///
/// Lines are decoded lossily; invalid UTF-8 never stops the pump.
async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, stream: LogStream, shared: Shared) {
    let mut splitter = LineSplitter::default();
    let mut extractor = ProgressExtractor::new();
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?stream, error = %e, "Stopped reading engine output");
                break;
            }
        };
        for line in splitter.push(&buf[..n]) {
            relay_line(stream, line, &mut extractor, &shared);
        }
    }

    if let Some(line) = splitter.finish() {
        relay_line(stream, line, &mut extractor, &shared);
    }
}

fn relay_line(stream: LogStream, line: String, extractor: &mut ProgressExtractor, shared: &Shared) {
    match stream {
        LogStream::Stdout => shared.emit(RunEvent::LogLine { stream, line }),
        LogStream::Stderr => relay_stderr_line(line, extractor, shared),
    }
}

fn relay_stderr_line(line: String, extractor: &mut ProgressExtractor, shared: &Shared) {
    let fact = extractor.feed(&line);
    shared.emit(RunEvent::LogLine {
        stream: LogStream::Stderr,
        line,
    });

    match fact {
        Some(ProgressFact::DurationAnnounced(seconds)) => {
            shared.emit(RunEvent::Duration { seconds });
        }
        Some(ProgressFact::TimeAdvanced(_)) => {
            if let Some(sample) = extractor.sample() {
                shared.emit(RunEvent::Progress(sample));
            }
        }
        None => {}
    }
}

/// Splits a byte stream into lines on `\n` and `\r`.
///
/// Blank lines are dropped, so `\r\n` never yields an empty line.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    fn finish(mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        (!line.trim().is_empty()).then_some(line)
    }
}
