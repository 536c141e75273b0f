//! Events streamed from a supervised run to the presentation layer.

use std::path::PathBuf;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::progress::ProgressSample;
use crate::error::RunFailure;

// =============================================================================
// Run State
// =============================================================================

/// Lifecycle of a supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// Output file exists, waiting for an overwrite decision.
    AwaitingDecision,
    Spawning,
    Running,
    Completed,
    Failed(RunFailure),
    Cancelled,
}

impl RunState {
    /// Returns true while a run holds (or is about to hold) the process slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::AwaitingDecision | Self::Spawning | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// Answer to a `CollisionDetected` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteDecision {
    /// Overwrite the existing file (adds `-y`).
    Proceed,
    /// Leave the file alone and cancel the run.
    Abort,
}

/// Which engine stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

// =============================================================================
// Events
// =============================================================================

/// Events sent from the supervisor to the UI.
///
/// Per run, stream lines arrive in the order the engine wrote them and
/// exactly one terminal event (`Completed`, `Failed`, `Cancelled`) is sent last.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Run accepted.
    Started { run_id: Uuid, args: Vec<String> },

    /// The designated output file already exists.
    CollisionDetected { path: PathBuf },

    /// One line of engine output.
    LogLine { stream: LogStream, line: String },

    /// The engine announced the total duration.
    Duration { seconds: f64 },

    /// The engine advanced its output position.
    Progress(ProgressSample),

    /// Engine exited with code 0.
    Completed,

    /// Run failed to start or the engine exited unsuccessfully.
    Failed(RunFailure),

    /// Run was cancelled by the user.
    Cancelled,
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

// =============================================================================
// Channel Types
// =============================================================================

/// Sender for run events.
pub type RunEventSender = mpsc::UnboundedSender<RunEvent>;

/// Receiver for run events.
pub type RunEventReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Create an event channel for streaming run events.
pub fn run_event_channel() -> (RunEventSender, RunEventReceiver) {
    mpsc::unbounded_channel()
}
