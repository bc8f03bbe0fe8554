//! Ordered line classification for external tool output.
//!
//! The wording matched here belongs to specific tool versions and drifts
//! over time. Rules are plain data so callers can extend or replace them.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Marker printed by the retrieval tool once a file has been moved into its
/// final location (see the `--print after_move:` argument).
pub const FILE_DONE_MARKER: &str = "__FETCHCAST_DONE__";

/// Why an item was skipped rather than failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Private,
    RegionBlocked,
    AgeRestricted,
    Removed,
    Unavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Private => "private",
            SkipReason::RegionBlocked => "region_blocked",
            SkipReason::AgeRestricted => "age_restricted",
            SkipReason::Removed => "removed",
            SkipReason::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The category a rule assigns to a matching line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Capture group 1 is the path of a finished output file.
    FileDone,
    /// Capture group 1 is a percentage (0-100).
    Percent,
    /// Capture group 1 is elapsed media time in microseconds.
    Elapsed,
    Skip(SkipReason),
    Error,
}

/// Result of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineClass {
    FileDone(String),
    Percent(f64),
    ElapsedMicros(u64),
    Skip(SkipReason),
    Error,
    Other,
}

/// One pattern-to-category rule.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    kind: LineKind,
    pattern: Regex,
}

impl ClassifierRule {
    pub fn new(kind: LineKind, pattern: &str) -> Result<Self, regex_lite::Error> {
        Ok(Self {
            kind,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn kind(&self) -> LineKind {
        self.kind
    }

    /// Returns `None` when the pattern does not match or its capture does
    /// not parse, letting later rules have a go.
    fn apply(&self, line: &str) -> Option<LineClass> {
        let caps = self.pattern.captures(line)?;
        let capture = caps.get(1).map(|m| m.as_str().trim());

        match self.kind {
            LineKind::FileDone => capture
                .map(|p| p.trim_matches('"'))
                .filter(|p| !p.is_empty())
                .map(|p| LineClass::FileDone(p.to_string())),
            LineKind::Percent => capture?
                .parse::<f64>()
                .ok()
                .map(|p| LineClass::Percent(p.clamp(0.0, 100.0))),
            LineKind::Elapsed => capture?.parse::<u64>().ok().map(LineClass::ElapsedMicros),
            LineKind::Skip(reason) => Some(LineClass::Skip(reason)),
            LineKind::Error => Some(LineClass::Error),
        }
    }
}

/// An ordered list of rules; the first rule that matches wins.
#[derive(Debug, Clone, Default)]
pub struct LineClassifier {
    rules: Vec<ClassifierRule>,
}

impl LineClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule built from `pattern`.
    pub fn with_rule(mut self, kind: LineKind, pattern: &str) -> Result<Self, regex_lite::Error> {
        self.rules.push(ClassifierRule::new(kind, pattern)?);
        Ok(self)
    }

    pub fn push(&mut self, rule: ClassifierRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    pub fn classify(&self, line: &str) -> LineClass {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(line))
            .unwrap_or(LineClass::Other)
    }

    /// Rules for yt-dlp style retrieval output.
    pub fn yt_dlp() -> Arc<Self> {
        Arc::clone(&YT_DLP)
    }

    /// Rules for ffmpeg run with `-progress pipe:2`.
    pub fn ffmpeg() -> Arc<Self> {
        Arc::clone(&FFMPEG)
    }
}

// Skip rules sit before the generic error rule so an unavailable item is
// never double counted as an error.
static YT_DLP: Lazy<Arc<LineClassifier>> = Lazy::new(|| {
    let rules: &[(LineKind, String)] = &[
        (LineKind::FileDone, format!(r"^{}\s+(.+)$", FILE_DONE_MARKER)),
        (
            LineKind::Percent,
            r"^\[download\]\s+(\d{1,3}(?:\.\d+)?)%".to_string(),
        ),
        (
            LineKind::Skip(SkipReason::Private),
            r"(?i)^ERROR:.*(?:private video|video is private)".to_string(),
        ),
        (
            LineKind::Skip(SkipReason::AgeRestricted),
            r"(?i)^ERROR:.*(?:age[- ]restricted|confirm your age|inappropriate for some users)"
                .to_string(),
        ),
        (
            LineKind::Skip(SkipReason::RegionBlocked),
            r"(?i)^ERROR:.*(?:available in your (?:country|region)|geo[- ]?(?:restricted|blocked)|blocked it in your country)"
                .to_string(),
        ),
        (
            LineKind::Skip(SkipReason::Removed),
            r"(?i)^ERROR:.*(?:has been removed|was removed|account .*terminated|copyright (?:claim|grounds))"
                .to_string(),
        ),
        (
            LineKind::Skip(SkipReason::Unavailable),
            r"(?i)^ERROR:.*(?:video unavailable|is unavailable|not available|does not exist|members[- ]only)"
                .to_string(),
        ),
        (LineKind::Error, r"(?i)^ERROR\b".to_string()),
    ];
    Arc::new(build(rules))
});

static FFMPEG: Lazy<Arc<LineClassifier>> = Lazy::new(|| {
    let rules: &[(LineKind, String)] = &[
        (LineKind::Elapsed, r"^out_time_(?:ms|us)=(\d+)$".to_string()),
        (
            LineKind::Error,
            r"(?i)\berror\b|invalid data found|could not find codec|no such file or directory"
                .to_string(),
        ),
    ];
    Arc::new(build(rules))
});

fn build(rules: &[(LineKind, String)]) -> LineClassifier {
    let mut classifier = LineClassifier::new();
    for (kind, pattern) in rules {
        match ClassifierRule::new(*kind, pattern) {
            Ok(rule) => classifier.push(rule),
            Err(e) => tracing::error!(pattern = %pattern, error = %e, "Invalid built-in line pattern"),
        }
    }
    classifier
}
