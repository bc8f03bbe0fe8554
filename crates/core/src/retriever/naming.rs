//! Download file naming.
//!
//! Downloads are named `<prefix> - <title> [<id>].<ext>` where the prefix is
//! the item identity (`<job_id>_<index>`). The title and id in the name are
//! the last-resort metadata source for an item.

use std::path::Path;

/// Output template for an invocation whose files start with `prefix`.
pub fn output_template(prefix: &str) -> String {
    format!("{} - %(title).150B [%(id)s].%(ext)s", prefix)
}

/// Prefix for whole-playlist invocations; the tool fills in the index.
pub fn playlist_prefix(job_id: &str) -> String {
    format!("{}_%(playlist_index)s", job_id)
}

/// What can be recovered from a downloaded file's name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedName {
    pub index: Option<u32>,
    pub title: Option<String>,
    pub id: Option<String>,
}

/// Parses a file name produced by [`output_template`] for `job_id`.
pub fn parse_output_name(job_id: &str, path: &Path) -> ParsedName {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return ParsedName::default();
    };
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);

    let (index, rest) = match stem
        .strip_prefix(job_id)
        .and_then(|rest| rest.strip_prefix('_'))
    {
        Some(rest) => {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            (digits.parse::<u32>().ok(), &rest[digits.len()..])
        }
        None => (None, stem),
    };

    let rest = rest.strip_prefix(" - ").unwrap_or(rest).trim();
    let (title, id) = match rest.strip_suffix(']').and_then(|r| r.rsplit_once(" [")) {
        Some((title, id)) => (title.trim(), Some(id.to_string())),
        None => (rest, None),
    };

    ParsedName {
        index,
        title: (!title.is_empty()).then(|| title.to_string()),
        id: id.filter(|id| !id.is_empty()),
    }
}
