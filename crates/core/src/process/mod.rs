//! External process driver.
//!
//! Runs one invocation of an external tool (the retrieval CLI or ffmpeg),
//! streams its stdout/stderr line by line through an ordered
//! [`LineClassifier`], and turns the result into typed [`ProcessEvent`]s plus
//! a final [`ProcessOutcome`] or [`ProcessError`].
//!
//! Every spawned child gets a [`ProcessHandle`]. Handles are shared with a
//! [`ProcessObserver`] (the job registry) so a job can request termination
//! of everything it started. Termination is graceful first (SIGTERM on unix),
//! then forceful once the grace window elapses.

mod classify;
mod driver;
mod error;
mod handle;
mod types;

pub use classify::{ClassifierRule, LineClass, LineClassifier, LineKind, SkipReason, FILE_DONE_MARKER};
pub use driver::{ProcessContext, ProcessDriver};
pub use error::ProcessError;
pub use handle::{ProcessHandle, ProcessObserver};
pub use types::{OutputDiscovery, ProcessEvent, ProcessOutcome, ProcessSpec};
