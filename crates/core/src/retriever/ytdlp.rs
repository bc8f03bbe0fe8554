//! yt-dlp based retriever implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::config::RetrieverConfig;
use super::error::RetrieverError;
use super::naming::{output_template, playlist_prefix};
use super::traits::Retriever;
use super::types::{EntryInfo, RetrievalOutput, RetrievalRequest, SourceInfo};
use crate::process::{
    LineClassifier, OutputDiscovery, ProcessContext, ProcessDriver, ProcessError, ProcessSpec,
    FILE_DONE_MARKER,
};

/// Retriever that shells out to yt-dlp.
pub struct YtDlpRetriever {
    config: RetrieverConfig,
    driver: ProcessDriver,
}

impl YtDlpRetriever {
    pub fn new(config: RetrieverConfig, driver: ProcessDriver) -> Self {
        Self { config, driver }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetrieverConfig::default(), ProcessDriver::default())
    }

    /// Builds arguments for one download invocation.
    fn build_args(&self, request: &RetrievalRequest) -> Vec<String> {
        let prefix = match &request.item_id {
            Some(item_id) => item_id.clone(),
            None => playlist_prefix(&request.job_id),
        };
        let template = request.temp_dir.join(output_template(&prefix));

        let mut args = vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-simulate".to_string(),
            "--no-part".to_string(),
            "--print".to_string(),
            format!("after_move:{} %(filepath)s", FILE_DONE_MARKER),
            "-o".to_string(),
            template.to_string_lossy().to_string(),
        ];

        if request.audio_only {
            args.extend(["-f".to_string(), "bestaudio/best".to_string()]);
        } else {
            args.extend(["-f".to_string(), "bv*+ba/b".to_string()]);
        }

        if request.is_batch {
            // Keep going past unavailable entries.
            args.extend(["--yes-playlist".to_string(), "--ignore-errors".to_string()]);
        } else {
            args.push("--no-playlist".to_string());
        }

        if let Some(selection) = request.selection.as_ref().filter(|s| !s.is_empty()) {
            let items = selection
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            args.extend(["--playlist-items".to_string(), items]);
        }

        if self.config.socket_timeout_secs > 0 {
            args.extend([
                "--socket-timeout".to_string(),
                self.config.socket_timeout_secs.to_string(),
            ]);
        }

        args.extend(self.config.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    fn build_probe_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        if self.config.socket_timeout_secs > 0 {
            args.extend([
                "--socket-timeout".to_string(),
                self.config.socket_timeout_secs.to_string(),
            ]);
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    /// Parses `-J --flat-playlist` output.
    fn parse_probe_output(output: &str) -> Result<SourceInfo, RetrieverError> {
        #[derive(Deserialize)]
        struct ProbeDoc {
            #[serde(rename = "_type")]
            kind: Option<String>,
            id: Option<String>,
            title: Option<String>,
            uploader: Option<String>,
            channel: Option<String>,
            playlist_count: Option<u32>,
            duration: Option<f64>,
            webpage_url: Option<String>,
            entries: Option<Vec<Option<ProbeEntry>>>,
        }

        #[derive(Deserialize)]
        struct ProbeEntry {
            id: Option<String>,
            url: Option<String>,
            title: Option<String>,
            uploader: Option<String>,
            channel: Option<String>,
            duration: Option<f64>,
            playlist_index: Option<u32>,
        }

        let doc: ProbeDoc =
            serde_json::from_str(output).map_err(|e| RetrieverError::ParseError {
                reason: format!("Failed to parse probe output: {}", e),
            })?;

        let is_playlist = doc.kind.as_deref() == Some("playlist") || doc.entries.is_some();
        if !is_playlist {
            return Ok(SourceInfo {
                title: doc.title.clone(),
                uploader: doc.uploader.or(doc.channel),
                is_playlist: false,
                entries: vec![EntryInfo {
                    index: 1,
                    id: doc.id,
                    url: doc.webpage_url,
                    title: doc.title,
                    uploader: None,
                    duration_secs: doc.duration,
                }],
                entry_count: Some(1),
            });
        }

        let entries: Vec<EntryInfo> = doc
            .entries
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let entry = entry?;
                Some(EntryInfo {
                    index: entry.playlist_index.unwrap_or(position as u32 + 1),
                    id: entry.id,
                    url: entry.url,
                    title: entry.title,
                    uploader: entry.uploader.or(entry.channel),
                    duration_secs: entry.duration,
                })
            })
            .collect();

        let entry_count = doc
            .playlist_count
            .or_else(|| (!entries.is_empty()).then_some(entries.len() as u32));

        Ok(SourceInfo {
            title: doc.title,
            uploader: doc.uploader.or(doc.channel),
            is_playlist: true,
            entries,
            entry_count,
        })
    }
}

#[async_trait]
impl Retriever for YtDlpRetriever {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn probe(&self, url: &str, ctx: &ProcessContext) -> Result<SourceInfo, RetrieverError> {
        if ctx.cancel.is_cancelled() {
            return Err(ProcessError::Canceled.into());
        }

        let mut command = Command::new(&self.config.binary);
        command
            .args(self.build_probe_args(url))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            output = command.output() => output.map_err(|source| ProcessError::Spawn {
                program: self.config.binary.display().to_string(),
                source,
            })?,
            _ = ctx.cancel.cancelled() => return Err(ProcessError::Canceled.into()),
            _ = tokio::time::sleep(self.config.probe_timeout()) => {
                return Err(RetrieverError::probe_failed(format!(
                    "probe timed out after {} seconds",
                    self.config.probe_timeout_secs
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RetrieverError::probe_failed(
                stderr.lines().last().unwrap_or("probe exited with an error").to_string(),
            ));
        }

        let info = Self::parse_probe_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!(
            url,
            playlist = info.is_playlist,
            entries = info.entries.len(),
            "Probed source"
        );
        Ok(info)
    }

    async fn retrieve(
        &self,
        request: RetrievalRequest,
        ctx: &ProcessContext,
    ) -> Result<RetrievalOutput, RetrieverError> {
        tokio::fs::create_dir_all(&request.temp_dir).await?;

        let expected = request.expected_total.unwrap_or(1);
        let spec = ProcessSpec::new(&self.config.binary, "yt-dlp", LineClassifier::yt_dlp())
            .with_args(self.build_args(&request))
            .with_cwd(&request.temp_dir)
            .with_timeout(self.config.invocation_timeout(expected))
            .with_expected_total(request.expected_total)
            .with_outputs(OutputDiscovery::Announced);

        let outcome = self.driver.run(&spec, ctx).await?;

        info!(
            job_id = %request.job_id,
            item = request.item_id.as_deref().unwrap_or("playlist"),
            files = outcome.files.len(),
            skipped = outcome.skipped,
            errors = outcome.errors,
            "Retrieval finished"
        );

        Ok(RetrievalOutput {
            files: outcome.files,
            skipped: outcome.skipped,
            errors: outcome.errors,
            skip_reasons: outcome.skip_reasons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request() -> RetrievalRequest {
        RetrievalRequest {
            job_id: "job".to_string(),
            item_id: Some("job_1".to_string()),
            url: "https://example.com/watch?v=abc".to_string(),
            is_batch: false,
            selection: None,
            audio_only: true,
            temp_dir: PathBuf::from("/tmp/fc/job"),
            expected_total: None,
        }
    }

    #[test]
    fn test_single_item_args() {
        let retriever = YtDlpRetriever::with_defaults();
        let args = retriever.build_args(&request());

        assert!(args.contains(&"--newline".to_string()));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(args.windows(2).any(|w| w == ["-f", "bestaudio/best"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--print", "after_move:__FETCHCAST_DONE__ %(filepath)s"]));
        assert!(args.windows(2).any(|w| w
            == [
                "-o",
                "/tmp/fc/job/job_1 - %(title).150B [%(id)s].%(ext)s"
            ]));
        assert!(args.windows(2).any(|w| w == ["--socket-timeout", "30"]));
        assert_eq!(args.last().unwrap(), "https://example.com/watch?v=abc");
    }

    #[test]
    fn test_playlist_args_with_selection() {
        let retriever = YtDlpRetriever::with_defaults();
        let mut request = request();
        request.item_id = None;
        request.is_batch = true;
        request.audio_only = false;
        request.selection = Some(vec![1, 3, 5]);

        let args = retriever.build_args(&request);

        assert!(args.contains(&"--yes-playlist".to_string()));
        assert!(args.contains(&"--ignore-errors".to_string()));
        assert!(args.windows(2).any(|w| w == ["--playlist-items", "1,3,5"]));
        assert!(args.windows(2).any(|w| w == ["-f", "bv*+ba/b"]));
        assert!(args
            .iter()
            .any(|a| a.starts_with("/tmp/fc/job/job_%(playlist_index)s - ")));
    }

    #[test]
    fn test_parse_playlist_probe() {
        let json = r#"{
            "_type": "playlist",
            "title": "Road Trip",
            "uploader": "someone",
            "playlist_count": 3,
            "entries": [
                {"id": "a1", "url": "https://example.com/a1", "title": "First", "channel": "Band"},
                null,
                {"id": "c3", "url": "https://example.com/c3", "title": "Third", "playlist_index": 3}
            ]
        }"#;
        let info = YtDlpRetriever::parse_probe_output(json).unwrap();
        assert!(info.is_playlist);
        assert_eq!(info.title.as_deref(), Some("Road Trip"));
        assert_eq!(info.entry_count, Some(3));
        assert_eq!(info.entries.len(), 2);
        assert_eq!(info.entries[0].index, 1);
        assert_eq!(info.entries[0].uploader.as_deref(), Some("Band"));
        assert_eq!(info.entries[1].index, 3);
    }

    #[test]
    fn test_parse_single_probe() {
        let json = r#"{"id": "abc", "title": "Clip", "channel": "Chan", "duration": 61.5,
                       "webpage_url": "https://example.com/watch?v=abc"}"#;
        let info = YtDlpRetriever::parse_probe_output(json).unwrap();
        assert!(!info.is_playlist);
        assert_eq!(info.entry_count, Some(1));
        assert_eq!(info.uploader.as_deref(), Some("Chan"));
        assert_eq!(info.entries[0].duration_secs, Some(61.5));
    }

    #[test]
    fn test_parse_probe_garbage() {
        let err = YtDlpRetriever::parse_probe_output("<html>").unwrap_err();
        assert!(matches!(err, RetrieverError::ParseError { .. }));
    }
}
