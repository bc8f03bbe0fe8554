//! Trait definitions for the converter module.

use async_trait::async_trait;
use std::path::Path;

use super::error::ConverterError;
use super::types::{ConversionJob, ConversionResult, MediaInfo};
use crate::process::ProcessContext;

/// A converter that can transcode media files.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Returns the name of this converter implementation.
    fn name(&self) -> &str;

    /// Probes a media file to get its information.
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ConverterError>;

    /// Converts one item.
    ///
    /// Progress is reported as [`ProcessEvent::PercentUpdate`](crate::process::ProcessEvent)
    /// through `ctx`, and the context's cancellation token stops the
    /// conversion.
    async fn convert(
        &self,
        job: ConversionJob,
        ctx: &ProcessContext,
    ) -> Result<ConversionResult, ConverterError>;

    /// Validates that the converter is properly configured and ready.
    async fn validate(&self) -> Result<(), ConverterError>;
}
