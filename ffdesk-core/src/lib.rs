//! FFDesk Core Library
//!
//! This crate provides the engine driver behind FFDesk, a desktop front end
//! for FFmpeg. It includes:
//!
//! - Command tokenizing and output-path detection
//! - Progress extraction from the engine's diagnostic stream
//! - A supervisor that runs one engine process at a time and streams events
//! - Command templates for common conversions
//! - On-demand provisioning of the engine binary (download, extract, install)
//! - Configuration from defaults and environment

pub mod config;
pub mod engine;
pub mod error;
pub mod provisioning;

// Re-exports for convenience
pub use config::EngineConfig;
pub use error::{CancelError, DecisionError, ProvisionError, RunFailure, StageError, StartError};

// Re-export engine
pub use engine::{
    run_event_channel, tokenize, CommandSpec, OverwriteDecision, ProgressExtractor, RunEvent,
    RunEventReceiver, RunEventSender, RunState, Supervisor,
};

// Re-export provisioning
pub use provisioning::{
    provision_event_channel, AssetDescriptor, InstallationState, Platform, ProvisionEvent,
    ProvisionEventReceiver, ProvisionEventSender, ProvisionStage, Provisioner,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn exports_are_accessible() {
        fn _check_types(
            _config: &EngineConfig,
            _supervisor: &Supervisor,
            _spec: &CommandSpec,
            _extractor: &ProgressExtractor,
            _provisioner: &Provisioner,
            _asset: &AssetDescriptor,
            _state: &InstallationState,
            _run_state: &RunState,
            _failure: &RunFailure,
        ) {
        }
    }

    #[test]
    fn user_agent_carries_version() {
        assert!(config::DEFAULT_USER_AGENT.ends_with(VERSION));
    }
}
