//! Converter module for transcoding retrieved media.
//!
//! This module provides the `Converter` trait and an FFmpeg implementation
//! that runs through the shared [`ProcessDriver`](crate::process::ProcessDriver),
//! so conversions report progress, honour job cancellation, and register
//! their process with the owning job like any other tool invocation.
//!
//! Outputs are written to a hidden `.partial-` file in the output directory
//! and renamed into place only after ffmpeg exits cleanly.

mod config;
mod error;
mod ffmpeg;
mod traits;
mod types;

pub use config::ConverterConfig;
pub use error::ConverterError;
pub use ffmpeg::FfmpegConverter;
pub use traits::Converter;
pub use types::{ConversionJob, ConversionResult, EmbeddedMetadata, MediaInfo, OutputFormat};
