//! Types for describing and observing one external process run.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::classify::{LineClassifier, SkipReason};

/// How the driver finds the files an invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDiscovery {
    /// Files are the ones announced by file-done lines.
    Announced,
    /// The invocation writes exactly this file.
    Fixed(PathBuf),
    /// Any finished file in `dir` whose name starts with `prefix`.
    Directory { dir: PathBuf, prefix: String },
}

/// Everything needed to run one external tool invocation.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Tool label used for logging, metrics and process handles.
    pub label: String,
    pub classifier: Arc<LineClassifier>,
    pub timeout: Option<Duration>,
    /// Media duration in seconds, used to turn elapsed time into a percentage.
    pub duration_hint: Option<f64>,
    /// Number of files the invocation is expected to produce, when known.
    pub expected_total: Option<u32>,
    pub outputs: OutputDiscovery,
}

impl ProcessSpec {
    pub fn new(
        program: impl Into<PathBuf>,
        label: impl Into<String>,
        classifier: Arc<LineClassifier>,
    ) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            label: label.into(),
            classifier,
            timeout: None,
            duration_hint: None,
            expected_total: None,
            outputs: OutputDiscovery::Announced,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_duration_hint(mut self, secs: Option<f64>) -> Self {
        self.duration_hint = secs.filter(|d| *d > 0.0);
        self
    }

    pub fn with_expected_total(mut self, total: Option<u32>) -> Self {
        self.expected_total = total.filter(|t| *t > 0);
        self
    }

    pub fn with_outputs(mut self, outputs: OutputDiscovery) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Structured events emitted while a process runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// An output file was written.
    FileDone {
        path: PathBuf,
        done: u32,
        total: Option<u32>,
    },
    /// Progress of the current file, plus its share of the whole
    /// invocation when the total is known.
    PercentUpdate { percent: f64, overall: Option<f64> },
    /// A skip-classified line, reported once per distinct line.
    SkipHint { reason: SkipReason, line: String },
    /// Final tallies, sent once when the process has exited.
    Summary {
        files: usize,
        skipped: u32,
        errors: u32,
    },
}

/// Result of a successful (possibly partially successful) invocation.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub files: Vec<PathBuf>,
    pub exit_code: Option<i32>,
    pub skipped: u32,
    pub errors: u32,
    pub skip_reasons: Vec<SkipReason>,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = ProcessSpec::new("yt-dlp", "yt-dlp", LineClassifier::yt_dlp())
            .with_args(["--newline", "-o"])
            .with_args(vec!["out.%(ext)s".to_string()])
            .with_cwd("/tmp/work")
            .with_expected_total(Some(0))
            .with_duration_hint(Some(12.5));

        assert_eq!(spec.args, vec!["--newline", "-o", "out.%(ext)s"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp/work")));
        assert_eq!(spec.expected_total, None);
        assert_eq!(spec.duration_hint, Some(12.5));
        assert_eq!(spec.outputs, OutputDiscovery::Announced);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ProcessEvent::SkipHint {
            reason: SkipReason::RegionBlocked,
            line: "ERROR: blocked".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "skip_hint");
        assert_eq!(json["reason"], "region_blocked");
    }
}
