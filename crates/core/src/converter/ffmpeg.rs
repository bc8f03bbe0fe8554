//! FFmpeg-based converter implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::config::ConverterConfig;
use super::error::ConverterError;
use super::traits::Converter;
use super::types::{ConversionJob, ConversionResult, MediaInfo};
use crate::metrics;
use crate::process::{LineClassifier, OutputDiscovery, ProcessContext, ProcessDriver, ProcessSpec};

/// FFmpeg-based converter implementation.
pub struct FfmpegConverter {
    config: ConverterConfig,
    driver: ProcessDriver,
}

impl FfmpegConverter {
    /// Creates a new FFmpeg converter with the given configuration.
    pub fn new(config: ConverterConfig, driver: ProcessDriver) -> Self {
        Self { config, driver }
    }

    /// Creates a converter with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ConverterConfig::default(), ProcessDriver::default())
    }

    /// Builds ffmpeg arguments writing `job` to `output_path`.
    fn build_args(&self, job: &ConversionJob, output_path: &Path) -> Vec<String> {
        let format = job.format;
        let mut args = vec![
            "-y".to_string(), // Overwrite output
            "-hide_banner".to_string(),
            "-i".to_string(),
            job.input_path.to_string_lossy().to_string(),
        ];

        let cover = job
            .cover_art_path
            .as_deref()
            .filter(|_| format.supports_cover_art());

        if let Some(video_codec) = format.video_codec() {
            args.extend([
                "-c:v".to_string(),
                video_codec.to_string(),
                "-c:a".to_string(),
                format.audio_codec().to_string(),
            ]);
        } else {
            // Add cover art if provided (for formats that support it)
            if let Some(cover_path) = cover {
                args.extend([
                    "-i".to_string(),
                    cover_path.to_string_lossy().to_string(),
                    "-map".to_string(),
                    "0:a".to_string(),
                    "-map".to_string(),
                    "1:v".to_string(),
                    "-c:v".to_string(),
                    "copy".to_string(),
                    "-disposition:v:0".to_string(),
                    "attached_pic".to_string(),
                ]);
            } else {
                args.push("-vn".to_string());
            }
            args.extend(["-c:a".to_string(), format.audio_codec().to_string()]);
        }

        // Bitrate (for lossy formats)
        if !format.is_lossless() {
            let bitrate = job.bitrate_kbps.unwrap_or(self.config.default_bitrate_kbps);
            args.extend(["-b:a".to_string(), format!("{}k", bitrate)]);
        }

        // Metadata
        if let Some(metadata) = &job.metadata {
            args.extend(metadata.to_ffmpeg_args());
        }

        // Log level and progress output for parsing
        args.extend([
            "-loglevel".to_string(),
            self.config.ffmpeg_log_level.clone(),
            "-nostats".to_string(),
            "-progress".to_string(),
            "pipe:2".to_string(),
        ]);

        // Extra args
        args.extend(self.config.extra_ffmpeg_args.iter().cloned());

        // Output
        args.push(output_path.to_string_lossy().to_string());

        args
    }

    /// Parses ffprobe JSON output into MediaInfo.
    fn parse_probe_output(path: &Path, output: &str) -> Result<MediaInfo, ConverterError> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            format: ProbeFormat,
            #[serde(default)]
            streams: Vec<ProbeStream>,
        }

        #[derive(Deserialize)]
        struct ProbeFormat {
            format_name: String,
            duration: Option<String>,
        }

        #[derive(Deserialize)]
        struct ProbeStream {
            codec_type: String,
        }

        let probe: ProbeOutput =
            serde_json::from_str(output).map_err(|e| ConverterError::ParseError {
                reason: format!("Failed to parse ffprobe output: {}", e),
            })?;

        let format_name = probe
            .format
            .format_name
            .split(',')
            .next()
            .unwrap_or("unknown");

        let mut info = MediaInfo::new(path, format_name);
        info.duration_secs = probe
            .format
            .duration
            .as_ref()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0);
        info.has_audio = probe.streams.iter().any(|s| s.codec_type == "audio");
        info.has_video = probe.streams.iter().any(|s| s.codec_type == "video");
        Ok(info)
    }

    async fn discard_partial(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "Failed to remove partial output");
            }
        }
    }
}

#[async_trait]
impl Converter for FfmpegConverter {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn probe(&self, path: &Path) -> Result<MediaInfo, ConverterError> {
        if !path.exists() {
            return Err(ConverterError::InputNotFound {
                path: path.to_path_buf(),
            });
        }

        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ConverterError::FfprobeNotFound {
                        path: self.config.ffprobe_path.clone(),
                    }
                } else {
                    ConverterError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(ConverterError::probe_failed(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Self::parse_probe_output(path, &stdout)
    }

    async fn convert(
        &self,
        job: ConversionJob,
        ctx: &ProcessContext,
    ) -> Result<ConversionResult, ConverterError> {
        if tokio::fs::metadata(&job.input_path).await.is_err() {
            return Err(ConverterError::InputNotFound {
                path: job.input_path.clone(),
            });
        }

        tokio::fs::create_dir_all(&job.output_dir)
            .await
            .map_err(|_| ConverterError::OutputDirectoryFailed {
                path: job.output_dir.clone(),
            })?;

        // Duration is only needed to turn elapsed time into a percentage.
        let duration_secs = self
            .probe(&job.input_path)
            .await
            .ok()
            .and_then(|info| info.duration_secs);

        let partial_path = job.partial_path();
        let output_path = job.output_path();
        let spec = ProcessSpec::new(
            &self.config.ffmpeg_path,
            "ffmpeg",
            LineClassifier::ffmpeg(),
        )
        .with_args(self.build_args(&job, &partial_path))
        .with_timeout(Duration::from_secs(self.config.timeout_secs))
        .with_duration_hint(duration_secs)
        .with_outputs(OutputDiscovery::Fixed(partial_path.clone()));

        debug!(item = %job.item_id, input = %job.input_path.display(), "Starting conversion");

        let outcome = match self.driver.run(&spec, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                Self::discard_partial(&partial_path).await;
                return Err(e.into());
            }
        };

        // A nonzero exit leaves a truncated file behind; never keep it.
        if outcome.exit_code != Some(0) {
            Self::discard_partial(&partial_path).await;
            return Err(ConverterError::conversion_failed(
                format!("FFmpeg exited with code: {:?}", outcome.exit_code),
                None,
            ));
        }

        tokio::fs::rename(&partial_path, &output_path).await?;
        let output_size_bytes = tokio::fs::metadata(&output_path).await?.len();

        metrics::CONVERSION_DURATION
            .with_label_values(&[job.format.extension()])
            .observe(outcome.elapsed.as_secs_f64());

        info!(
            item = %job.item_id,
            output = %output_path.display(),
            duration_ms = outcome.elapsed.as_millis() as u64,
            "Conversion finished"
        );

        Ok(ConversionResult {
            item_id: job.item_id,
            output_path,
            output_size_bytes,
            duration_ms: outcome.elapsed.as_millis() as u64,
            format: job.format,
        })
    }

    async fn validate(&self) -> Result<(), ConverterError> {
        for (path, is_ffmpeg) in [
            (&self.config.ffmpeg_path, true),
            (&self.config.ffprobe_path, false),
        ] {
            if let Err(e) = Command::new(path).arg("-version").output().await {
                if e.kind() == std::io::ErrorKind::NotFound {
                    return Err(if is_ffmpeg {
                        ConverterError::FfmpegNotFound { path: path.clone() }
                    } else {
                        ConverterError::FfprobeNotFound { path: path.clone() }
                    });
                }
                return Err(ConverterError::Io(e));
            }
        }
        Ok(())
    }
}
