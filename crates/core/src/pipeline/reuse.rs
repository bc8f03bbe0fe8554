//! Output reuse check.
//!
//! Per-item outputs are named `<job_id>_<index>.<ext>`. Before downloading
//! or converting an item the output directory is scanned for a finished
//! file with that identity and an extension the target format accepts.
//! Conversions write to a hidden partial file and rename on success, so any
//! file that matches is complete.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::converter::OutputFormat;

/// Identity of one item of a job, used as the output file stem.
pub fn item_identity(job_id: &str, index: u32) -> String {
    format!("{}_{}", job_id, index)
}

/// Finds a previously produced, non-empty output for `identity`.
pub async fn find_reusable_output(
    output_dir: &Path,
    identity: &str,
    format: OutputFormat,
) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(output_dir).await.ok()?;
    let mut matches = Vec::new();

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matches_identity(name, identity, format) {
            continue;
        }
        match entry.metadata().await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => matches.push(entry.path()),
            _ => {}
        }
    }

    matches.sort();
    let found = matches.into_iter().next();
    if let Some(path) = &found {
        debug!(identity, path = %path.display(), "Reusing existing output");
    }
    found
}

fn matches_identity(name: &str, identity: &str, format: OutputFormat) -> bool {
    let Some(rest) = name.strip_prefix(identity) else {
        return false;
    };
    // "abc_1" must not match "abc_10.mp3".
    if !(rest.starts_with('.') || rest.starts_with(' ')) {
        return false;
    }
    let Some((_, ext)) = rest.rsplit_once('.') else {
        return false;
    };
    format
        .accepted_extensions()
        .iter()
        .any(|accepted| accepted.eq_ignore_ascii_case(ext))
}
