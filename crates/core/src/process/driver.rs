//! Spawning and supervising external processes.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify::{LineClass, LineClassifier, SkipReason};
use super::error::ProcessError;
use super::handle::{ProcessHandle, ProcessObserver};
use super::types::{OutputDiscovery, ProcessEvent, ProcessOutcome, ProcessSpec};
use crate::metrics;

const STDERR_TAIL_LINES: usize = 20;
/// How long output is still read after the process itself has exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);
const CANCEL_WORDS: [&str; 3] = ["terminated", "killed", "aborted"];

/// Per-run wiring: the job's cancellation token, where events go, and who
/// is told about spawned processes.
#[derive(Clone)]
pub struct ProcessContext {
    pub cancel: CancellationToken,
    pub events: Option<mpsc::UnboundedSender<ProcessEvent>>,
    pub observer: Option<Arc<dyn ProcessObserver>>,
}

impl ProcessContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            events: None,
            observer: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProcessObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub(crate) fn emit(&self, event: ProcessEvent) {
        if let Some(tx) = &self.events {
            // Receiver gone means nobody is watching progress anymore.
            let _ = tx.send(event);
        }
    }
}

/// Runs external tools and translates their output into events.
#[derive(Debug, Clone)]
pub struct ProcessDriver {
    kill_grace: Duration,
}

impl Default for ProcessDriver {
    fn default() -> Self {
        Self::new(Duration::from_millis(3000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Canceled,
    TimedOut,
}

impl ProcessDriver {
    /// Creates a driver that waits `kill_grace` between SIGTERM and SIGKILL.
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    /// Runs one invocation to completion, cancellation, or timeout.
    pub async fn run(
        &self,
        spec: &ProcessSpec,
        ctx: &ProcessContext,
    ) -> Result<ProcessOutcome, ProcessError> {
        if ctx.cancel.is_cancelled() {
            return Err(ProcessError::Canceled);
        }

        let started = Instant::now();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;
        metrics::PROCESS_SPAWNS
            .with_label_values(&[spec.label.as_str()])
            .inc();

        let handle = ProcessHandle::new(spec.label.clone(), child.id());
        debug!(
            label = %spec.label,
            pid = ?handle.pid(),
            args = ?spec.args,
            "Spawned process"
        );
        if let Some(observer) = &ctx.observer {
            observer.on_spawn(&handle);
        }

        let result = self.supervise(&mut child, &handle, spec, ctx, started).await;

        if let Some(observer) = &ctx.observer {
            observer.on_exit(&handle);
        }
        result
    }

    async fn supervise(
        &self,
        child: &mut Child,
        handle: &ProcessHandle,
        spec: &ProcessSpec,
        ctx: &ProcessContext,
        started: Instant,
    ) -> Result<ProcessOutcome, ProcessError> {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, Stream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, Stream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut state = LineState::new(spec);
        let deadline = spec.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut streams_open = true;
        // Set once the child has exited; a descendant may still hold its pipes.
        let mut exited: Option<std::io::Result<ExitStatus>> = None;
        let mut drain_deadline = None;

        let exit = loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break Exit::Canceled,
                _ = handle.terminate_requested() => break Exit::Canceled,
                _ = sleep_until(deadline) => break Exit::TimedOut,
                line = line_rx.recv(), if streams_open => match line {
                    Some((stream, text)) => state.handle(stream, &text, ctx),
                    None => {
                        streams_open = false;
                        if let Some(status) = exited.take() {
                            break Exit::Status(status);
                        }
                    }
                },
                status = child.wait(), if exited.is_none() => {
                    if !streams_open {
                        break Exit::Status(status);
                    }
                    exited = Some(status);
                    drain_deadline = Some(tokio::time::Instant::now() + OUTPUT_DRAIN);
                }
                _ = sleep_until(drain_deadline), if drain_deadline.is_some() => {
                    debug!(label = %spec.label, "Output still open after exit, not waiting further");
                    if let Some(status) = exited.take() {
                        break Exit::Status(status);
                    }
                    drain_deadline = None;
                }
            }
        };

        match exit {
            Exit::Canceled => {
                self.terminate(child).await;
                ctx.emit(state.summary(state.files.len()));
                info!(label = %spec.label, "Process canceled");
                Err(ProcessError::Canceled)
            }
            Exit::TimedOut => {
                self.terminate(child).await;
                ctx.emit(state.summary(state.files.len()));
                let timeout_secs = spec.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(label = %spec.label, timeout_secs, "Process timed out");
                Err(ProcessError::Timeout {
                    program: spec.label.clone(),
                    timeout_secs,
                })
            }
            Exit::Status(status) => {
                let status = status?;
                let files = discover_outputs(&spec.outputs, &state.files).await;
                ctx.emit(state.summary(files.len()));
                state.finish(status, files, spec, started)
            }
        }
    }

    /// SIGTERM, wait out the grace window, then kill.
    async fn terminate(&self, child: &mut Child) {
        if request_exit(child) {
            match tokio::time::timeout(self.kill_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(?status, "Process exited after SIGTERM");
                    return;
                }
                Ok(Err(e)) => debug!(error = %e, "Waiting after SIGTERM failed"),
                Err(_) => debug!(
                    grace_ms = self.kill_grace.as_millis() as u64,
                    "Grace window elapsed, killing process"
                ),
            }
        }
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Failed to kill process");
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    match child.id() {
        // SAFETY: the pid belongs to a child we spawned and have not reaped.
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}

#[cfg(unix)]
fn terminated_by_signal(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn terminated_by_signal(_status: &ExitStatus) -> bool {
    false
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, ?stream, "Stopped reading process output");
                break;
            }
        }
    }
}

/// Running tallies for one invocation.
struct LineState {
    classifier: Arc<LineClassifier>,
    label: String,
    cwd: Option<PathBuf>,
    expected_total: Option<u32>,
    duration_hint: Option<f64>,
    files: Vec<PathBuf>,
    skipped: u32,
    errors: u32,
    skip_reasons: Vec<SkipReason>,
    seen_skip_lines: HashSet<String>,
    stderr_tail: VecDeque<String>,
}

impl LineState {
    fn new(spec: &ProcessSpec) -> Self {
        Self {
            classifier: Arc::clone(&spec.classifier),
            label: spec.label.clone(),
            cwd: spec.cwd.clone(),
            expected_total: spec.expected_total,
            duration_hint: spec.duration_hint,
            files: Vec::new(),
            skipped: 0,
            errors: 0,
            skip_reasons: Vec::new(),
            seen_skip_lines: HashSet::new(),
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
        }
    }

    fn handle(&mut self, stream: Stream, raw: &str, ctx: &ProcessContext) {
        let line = raw.trim_end();
        if line.is_empty() {
            return;
        }
        if stream == Stream::Stderr {
            if self.stderr_tail.len() == STDERR_TAIL_LINES {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line.to_string());
        }

        match self.classifier.classify(line) {
            LineClass::FileDone(raw_path) => {
                let path = self.resolve(&raw_path);
                if self.files.contains(&path) {
                    return;
                }
                self.files.push(path.clone());
                ctx.emit(ProcessEvent::FileDone {
                    path,
                    done: self.files.len() as u32,
                    total: self.expected_total,
                });
            }
            LineClass::Percent(percent) => ctx.emit(self.percent_event(percent)),
            LineClass::ElapsedMicros(micros) => {
                if let Some(duration) = self.duration_hint {
                    let percent = (micros as f64 / 1_000_000.0 / duration * 100.0).clamp(0.0, 100.0);
                    ctx.emit(self.percent_event(percent));
                }
            }
            LineClass::Skip(reason) => {
                if self.seen_skip_lines.insert(line.to_string()) {
                    self.skipped += 1;
                    self.skip_reasons.push(reason);
                    debug!(label = %self.label, %reason, line, "Skip hint");
                    ctx.emit(ProcessEvent::SkipHint {
                        reason,
                        line: line.to_string(),
                    });
                }
            }
            LineClass::Error => {
                self.errors += 1;
                debug!(label = %self.label, line, "Tool reported an error");
            }
            LineClass::Other => {}
        }
    }

    fn percent_event(&self, percent: f64) -> ProcessEvent {
        let overall = self.expected_total.map(|total| {
            ((self.files.len() as f64 + percent / 100.0) / total as f64 * 100.0).min(100.0)
        });
        ProcessEvent::PercentUpdate { percent, overall }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        match &self.cwd {
            Some(cwd) if path.is_relative() => cwd.join(path),
            _ => path,
        }
    }

    fn summary(&self, files: usize) -> ProcessEvent {
        ProcessEvent::Summary {
            files,
            skipped: self.skipped,
            errors: self.errors,
        }
    }

    fn mentions_cancel(&self) -> bool {
        self.stderr_tail.iter().any(|line| {
            let line = line.to_lowercase();
            CANCEL_WORDS.iter().any(|word| line.contains(word))
        })
    }

    fn finish(
        self,
        status: ExitStatus,
        files: Vec<PathBuf>,
        spec: &ProcessSpec,
        started: Instant,
    ) -> Result<ProcessOutcome, ProcessError> {
        let code = status.code();
        if code.is_none() && (terminated_by_signal(&status) || self.mentions_cancel()) {
            info!(label = %spec.label, "Process terminated by signal");
            return Err(ProcessError::Canceled);
        }

        if !files.is_empty() {
            if !status.success() {
                warn!(
                    label = %spec.label,
                    ?code,
                    files = files.len(),
                    skipped = self.skipped,
                    errors = self.errors,
                    "Process exited with errors but produced output"
                );
            }
            return Ok(ProcessOutcome {
                files,
                exit_code: code,
                skipped: self.skipped,
                errors: self.errors,
                skip_reasons: self.skip_reasons,
                elapsed: started.elapsed(),
            });
        }

        Err(ProcessError::Failed {
            program: spec.label.clone(),
            code,
            skip_reason: self.skip_reasons.first().copied(),
            stderr_tail: self.stderr_tail.into_iter().collect(),
            skipped: self.skipped,
            errors: self.errors,
        })
    }
}

async fn discover_outputs(outputs: &OutputDiscovery, announced: &[PathBuf]) -> Vec<PathBuf> {
    match outputs {
        OutputDiscovery::Announced => {
            let mut found = Vec::with_capacity(announced.len());
            for path in announced {
                if is_file(path).await {
                    found.push(path.clone());
                }
            }
            found
        }
        OutputDiscovery::Fixed(path) => {
            if is_file(path).await {
                vec![path.clone()]
            } else {
                Vec::new()
            }
        }
        OutputDiscovery::Directory { dir, prefix } => {
            let mut found = Vec::new();
            let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
                return found;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let path = entry.path();
                if name.starts_with(prefix.as_str()) && !is_partial_name(&name) && is_file(&path).await
                {
                    found.push(path);
                }
            }
            found.sort();
            found
        }
    }
}

fn is_partial_name(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".ytdl") || name.ends_with(".temp") || name.contains(".part-Frag")
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
