//! Error types shared by the engine supervisor and the provisioning pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::provisioning::types::ProvisionStage;

// =============================================================================
// Run Errors
// =============================================================================

/// Reasons a `start()` call is refused. A refused start has no side effects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("A run is already active")]
    Busy,
    #[error("Empty command. Please provide a valid FFmpeg command.")]
    EmptyCommand,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CancelError {
    #[error("No running FFmpeg process to cancel")]
    NotRunning,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecisionError {
    #[error("No overwrite decision is pending")]
    NoPendingDecision,
}

/// Why a run ended in `Failed`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunFailure {
    /// The engine binary is missing or not executable.
    #[error("FFmpeg binary not available at {}", .0.display())]
    BinaryUnavailable(PathBuf),
    /// The OS refused to start the process.
    #[error("FFmpeg process error: {0}")]
    Spawn(String),
    /// The engine exited with a non-zero code.
    #[error("FFmpeg process exited with code {0}")]
    ExitCode(i32),
    /// The engine was terminated by a signal it was not asked to receive.
    #[error("FFmpeg process was terminated without an exit code")]
    Terminated,
}

// =============================================================================
// Provisioning Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("FFmpeg downloads are not available for this platform ({0})")]
    UnsupportedPlatform(String),
    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(String),
    #[error("No 7-Zip executable found (tried {0})")]
    ExtractorUnavailable(String),
    #[error("Extraction failed: {0}")]
    Extraction(String),
    #[error("FFmpeg executable not found in the extracted files")]
    BinaryNotFound,
    #[error("Verification failed: {0}")]
    Verification(String),
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<std::io::Error> for ProvisionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(anyhow::Error::new(err))
    }
}

/// A provisioning failure tagged with the stage it happened in.
#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct StageError {
    pub stage: ProvisionStage,
    #[source]
    pub source: ProvisionError,
}

impl StageError {
    pub fn new(stage: ProvisionStage, source: ProvisionError) -> Self {
        Self { stage, source }
    }
}
