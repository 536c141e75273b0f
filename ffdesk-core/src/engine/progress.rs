//! Progress extraction from engine diagnostic output.
//!
//! The engine reports the input duration once (`Duration: 00:01:30.00, ...`)
//! and then rewrites a status line carrying `time=00:00:45.00`. Neither is
//! structured, so anything that does not match is simply not progress.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid duration regex")
    })
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid time regex")
    })
}

// =============================================================================
// Facts and Samples
// =============================================================================

/// Progress information carried by a single output line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressFact {
    /// Total media duration in seconds.
    DurationAnnounced(f64),
    /// Current output position in seconds.
    TimeAdvanced(f64),
}

/// Snapshot of run progress, superseded by each new sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub current_time_seconds: f64,
    /// `None` until the engine has announced a duration.
    pub total_duration_seconds: Option<f64>,
}

impl ProgressSample {
    /// Percentage complete, or `None` while it would be meaningless.
    pub fn percent(&self) -> Option<f64> {
        self.total_duration_seconds
            .and_then(|total| compute_percent(self.current_time_seconds, total))
    }
}

/// `min(100, 100 * current / duration)`, clamped to `[0, 100]`.
///
/// Returns `None` when the duration is not a positive number.
pub fn compute_percent(current_seconds: f64, duration_seconds: f64) -> Option<f64> {
    if duration_seconds.is_nan() || duration_seconds <= 0.0 || !current_seconds.is_finite() {
        return None;
    }

    Some((current_seconds / duration_seconds * 100.0).clamp(0.0, 100.0))
}

/// Converts `H`, `M`, `S[.ff]` captures into seconds.
fn captures_to_seconds(caps: &regex::Captures<'_>) -> Option<f64> {
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Formats seconds as `HH:MM:SS` (seconds rounded up, as shown in logs).
pub fn format_timestamp(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "--:--:--".to_string();
    }

    let total = seconds.ceil() as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total / 60) % 60,
        total % 60
    )
}

// =============================================================================
// Extractor
// =============================================================================

/// Per-run progress parser.
///
/// Remembers the most recently announced duration; create one per run so a
/// stale duration never leaks into the next run.
#[derive(Debug, Default, Clone)]
pub struct ProgressExtractor {
    duration: Option<f64>,
    current: Option<f64>,
}

impl ProgressExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one line. Lines without progress data yield `None`.
    pub fn feed(&mut self, line: &str) -> Option<ProgressFact> {
        if let Some(seconds) = duration_regex()
            .captures(line)
            .and_then(|caps| captures_to_seconds(&caps))
        {
            self.duration = Some(seconds);
            return Some(ProgressFact::DurationAnnounced(seconds));
        }

        if let Some(seconds) = time_regex()
            .captures(line)
            .and_then(|caps| captures_to_seconds(&caps))
        {
            self.current = Some(seconds);
            return Some(ProgressFact::TimeAdvanced(seconds));
        }

        None
    }

    /// Last announced duration in seconds.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Latest sample, once any time has been reported.
    pub fn sample(&self) -> Option<ProgressSample> {
        self.current.map(|current| ProgressSample {
            current_time_seconds: current,
            total_duration_seconds: self.duration,
        })
    }
}
