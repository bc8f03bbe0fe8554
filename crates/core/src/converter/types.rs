//! Types for the converter module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Target output format of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    M4a,
    Opus,
    Ogg,
    Flac,
    Wav,
    Mp4,
    Mkv,
    Webm,
}

impl OutputFormat {
    /// Extension written for new outputs.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::M4a => "m4a",
            OutputFormat::Opus => "opus",
            OutputFormat::Ogg => "ogg",
            OutputFormat::Flac => "flac",
            OutputFormat::Wav => "wav",
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Mkv => "mkv",
            OutputFormat::Webm => "webm",
        }
    }

    /// Extensions an existing output may carry and still count as this format.
    pub fn accepted_extensions(&self) -> &'static [&'static str] {
        match self {
            OutputFormat::Mp3 => &["mp3"],
            OutputFormat::M4a => &["m4a", "mp4", "aac"],
            OutputFormat::Opus => &["opus", "ogg"],
            OutputFormat::Ogg => &["ogg", "oga"],
            OutputFormat::Flac => &["flac"],
            OutputFormat::Wav => &["wav"],
            OutputFormat::Mp4 => &["mp4", "m4v"],
            OutputFormat::Mkv => &["mkv"],
            OutputFormat::Webm => &["webm"],
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, OutputFormat::Mp4 | OutputFormat::Mkv | OutputFormat::Webm)
    }

    /// FFmpeg audio encoder.
    pub fn audio_codec(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "libmp3lame",
            OutputFormat::M4a | OutputFormat::Mp4 | OutputFormat::Mkv => "aac",
            OutputFormat::Opus | OutputFormat::Webm => "libopus",
            OutputFormat::Ogg => "libvorbis",
            OutputFormat::Flac => "flac",
            OutputFormat::Wav => "pcm_s16le",
        }
    }

    /// FFmpeg video encoder, for video targets.
    pub fn video_codec(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Mp4 | OutputFormat::Mkv => Some("libx264"),
            OutputFormat::Webm => Some("libvpx-vp9"),
            _ => None,
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, OutputFormat::Flac | OutputFormat::Wav)
    }

    /// Whether an attached picture can be embedded.
    pub fn supports_cover_art(&self) -> bool {
        matches!(self, OutputFormat::Mp3 | OutputFormat::M4a | OutputFormat::Flac)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "m4a" | "aac" => Ok(OutputFormat::M4a),
            "opus" => Ok(OutputFormat::Opus),
            "ogg" | "vorbis" => Ok(OutputFormat::Ogg),
            "flac" => Ok(OutputFormat::Flac),
            "wav" => Ok(OutputFormat::Wav),
            "mp4" => Ok(OutputFormat::Mp4),
            "mkv" => Ok(OutputFormat::Mkv),
            "webm" => Ok(OutputFormat::Webm),
            other => Err(format!("unsupported output format: {}", other)),
        }
    }
}

/// Metadata to embed in output files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_number: Option<u32>,
}

impl EmbeddedMetadata {
    /// Converts metadata to FFmpeg arguments.
    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(ref title) = self.title {
            args.extend(["-metadata".to_string(), format!("title={}", title)]);
        }
        if let Some(ref artist) = self.artist {
            args.extend(["-metadata".to_string(), format!("artist={}", artist)]);
        }
        if let Some(ref album) = self.album {
            args.extend(["-metadata".to_string(), format!("album={}", album)]);
        }
        if let Some(track) = self.track_number {
            args.extend(["-metadata".to_string(), format!("track={}", track)]);
        }

        args
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.track_number.is_none()
    }
}

/// A conversion request for one item.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    /// Item identity, also the output file stem (`<job_id>_<index>`).
    pub item_id: String,
    /// Input file path.
    pub input_path: PathBuf,
    /// Directory the finished output is placed in.
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    /// Bitrate for lossy formats; the converter default applies when unset.
    pub bitrate_kbps: Option<u32>,
    /// Metadata to embed.
    pub metadata: Option<EmbeddedMetadata>,
    /// Cover art to embed (for audio).
    pub cover_art_path: Option<PathBuf>,
}

impl ConversionJob {
    pub fn output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.item_id, self.format.extension()))
    }

    /// Where ffmpeg writes before the output is renamed into place.
    pub fn partial_path(&self) -> PathBuf {
        self.output_dir
            .join(format!(".partial-{}.{}", self.item_id, self.format.extension()))
    }
}

/// Result of a successful conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub item_id: String,
    /// Output file path.
    pub output_path: PathBuf,
    /// Output file size in bytes.
    pub output_size_bytes: u64,
    /// Conversion duration in milliseconds.
    pub duration_ms: u64,
    pub format: OutputFormat,
}

/// Information about a media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: PathBuf,
    /// Duration in seconds, when the container reports one.
    pub duration_secs: Option<f64>,
    /// Container format (e.g., "matroska", "mp3").
    pub format: String,
    pub has_audio: bool,
    pub has_video: bool,
}

impl MediaInfo {
    pub fn new(path: &Path, format: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            duration_secs: None,
            format: format.into(),
            has_audio: false,
            has_video: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_extension() {
        assert_eq!(OutputFormat::Mp3.extension(), "mp3");
        assert_eq!(OutputFormat::Ogg.extension(), "ogg");
        assert_eq!(OutputFormat::Webm.to_string(), "webm");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("MP3".parse::<OutputFormat>(), Ok(OutputFormat::Mp3));
        assert_eq!("aac".parse::<OutputFormat>(), Ok(OutputFormat::M4a));
        assert!("avi".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_format_serde() {
        let json = serde_json::to_string(&OutputFormat::Flac).unwrap();
        assert_eq!(json, "\"flac\"");
        let parsed: OutputFormat = serde_json::from_str("\"opus\"").unwrap();
        assert_eq!(parsed, OutputFormat::Opus);
    }

    #[test]
    fn test_format_properties() {
        assert!(OutputFormat::Flac.is_lossless());
        assert!(!OutputFormat::Mp3.is_lossless());
        assert!(OutputFormat::Mkv.is_video());
        assert_eq!(OutputFormat::Mp3.video_codec(), None);
        assert_eq!(OutputFormat::Webm.video_codec(), Some("libvpx-vp9"));
        assert!(OutputFormat::M4a.accepted_extensions().contains(&"mp4"));
    }

    #[test]
    fn test_metadata_args() {
        let metadata = EmbeddedMetadata {
            title: Some("Song".to_string()),
            artist: Some("Band".to_string()),
            track_number: Some(4),
            ..Default::default()
        };
        assert_eq!(
            metadata.to_ffmpeg_args(),
            vec!["-metadata", "title=Song", "-metadata", "artist=Band", "-metadata", "track=4"]
        );
        assert!(EmbeddedMetadata::default().is_empty());
    }

    #[test]
    fn test_job_paths() {
        let job = ConversionJob {
            item_id: "abc_2".to_string(),
            input_path: PathBuf::from("/tmp/abc/abc_2 - Song [x].webm"),
            output_dir: PathBuf::from("/out"),
            format: OutputFormat::Mp3,
            bitrate_kbps: None,
            metadata: None,
            cover_art_path: None,
        };
        assert_eq!(job.output_path(), PathBuf::from("/out/abc_2.mp3"));
        assert_eq!(job.partial_path(), PathBuf::from("/out/.partial-abc_2.mp3"));
    }
}
