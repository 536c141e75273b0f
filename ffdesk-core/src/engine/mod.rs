//! Engine invocation: command parsing, progress tracking, and process supervision.
//!
//! The presentation layer hands a raw command string to [`Supervisor::start`]
//! and consumes [`RunEvent`]s from the channel it created with
//! [`run_event_channel`].

pub mod events;
pub mod progress;
pub mod supervisor;
pub mod templates;
pub mod tokenizer;

pub use events::{
    run_event_channel, LogStream, OverwriteDecision, RunEvent, RunEventReceiver, RunEventSender,
    RunState,
};
pub use progress::{
    compute_percent, format_timestamp, ProgressExtractor, ProgressFact, ProgressSample,
};
pub use supervisor::Supervisor;
pub use templates::{all_templates, find_template, insert_paths, CommandTemplate};
pub use tokenizer::{find_output_path, quote_for_shell, tokenize, CommandSpec, OVERWRITE_FLAG};
