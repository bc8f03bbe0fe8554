//! Configuration for the retriever module.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the yt-dlp based retriever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// Path to the yt-dlp compatible binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Socket timeout passed to the tool in seconds (0 leaves the tool default).
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,

    /// Timeout for one item's download in seconds. A whole-playlist
    /// invocation gets this once per expected item.
    #[serde(default = "default_item_timeout")]
    pub item_timeout_secs: u64,

    /// Timeout for metadata probing in seconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Additional arguments appended before the URL.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_socket_timeout() -> u64 {
    30
}

fn default_item_timeout() -> u64 {
    1800
}

fn default_probe_timeout() -> u64 {
    120
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            socket_timeout_secs: default_socket_timeout(),
            item_timeout_secs: default_item_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            extra_args: Vec::new(),
        }
    }
}

impl RetrieverConfig {
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            ..Default::default()
        }
    }

    /// Timeout for an invocation expected to produce `items` files.
    pub fn invocation_timeout(&self, items: u32) -> Duration {
        Duration::from_secs(self.item_timeout_secs.saturating_mul(items.max(1) as u64))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
