//! Command-line tokenizer for engine invocations.
//!
//! Splits a raw command string into an argument vector. The rules are
//! deliberately permissive because saved templates rely on them:
//!
//! - whitespace outside quotes separates arguments, runs collapse
//! - `"` toggles quoted mode, whitespace inside quotes is literal
//! - `\"` is a literal quote, any other backslash is kept verbatim
//! - an unterminated quote is closed at end of input

use std::path::PathBuf;

use crate::provisioning::types::Platform;

/// Flag telling the engine to overwrite existing output files.
pub const OVERWRITE_FLAG: &str = "-y";

/// Flag introducing an input file.
const INPUT_FLAG: &str = "-i";

// =============================================================================
// Tokenizing
// =============================================================================

/// Splits `command` into arguments.
///
/// Closing a quote ends the current argument, so `"a b"c` yields `a b` and `c`.
/// Empty quotes produce nothing.
pub fn tokenize(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' => {
                in_quotes = !in_quotes;
                if !in_quotes && !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if in_quotes {
        tracing::debug!("Unterminated quote in command, closing at end of input");
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Picks the argument most likely to be the output file.
///
/// Scans from the end for the last argument that is not a flag, is not the
/// first argument, and is not the value of `-i`.
pub fn find_output_path(args: &[String]) -> Option<&str> {
    (1..args.len())
        .rev()
        .find(|&i| !args[i].starts_with('-') && args[i - 1] != INPUT_FLAG)
        .map(|i| args[i].trim_matches('"'))
        .filter(|s| !s.is_empty())
}

/// Quotes `arg` so it survives being embedded in a shell command string.
///
/// Arguments containing whitespace, or a drive-style colon on Windows, are
/// wrapped in double quotes with inner quotes escaped. Arguments that already
/// start with a quote are returned unchanged.
pub fn quote_for_shell(arg: &str, platform: Platform) -> String {
    if arg.starts_with('"') {
        return arg.to_string();
    }

    let needs_quotes = arg.chars().any(char::is_whitespace)
        || (platform.is_windows() && arg.contains(':'));

    if needs_quotes {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

// =============================================================================
// Command Spec
// =============================================================================

/// A tokenized engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    args: Vec<String>,
    output_path: Option<PathBuf>,
}

impl CommandSpec {
    /// Tokenizes `raw` and designates an output path.
    pub fn parse(raw: &str) -> Self {
        let args = tokenize(raw);
        let output_path = find_output_path(&args).map(PathBuf::from);
        Self { args, output_path }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// File the run is expected to write, used for collision checks.
    pub fn output_path(&self) -> Option<&std::path::Path> {
        self.output_path.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns a copy that forces the engine to overwrite its output.
    pub fn with_overwrite(&self) -> Self {
        if self.args.iter().any(|a| a == OVERWRITE_FLAG) {
            return self.clone();
        }

        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(OVERWRITE_FLAG.to_string());
        args.extend(self.args.iter().cloned());

        Self {
            args,
            output_path: self.output_path.clone(),
        }
    }

    /// Renders the arguments as a single shell-safe string for display.
    pub fn display_line(&self, platform: Platform) -> String {
        self.args
            .iter()
            .map(|a| quote_for_shell(a, platform))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
