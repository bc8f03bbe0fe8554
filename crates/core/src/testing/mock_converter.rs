//! Mock converter for testing.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{simulate_process, ConcurrencyProbe};
use crate::converter::{ConversionJob, ConversionResult, Converter, ConverterError, MediaInfo};
use crate::process::{ProcessContext, ProcessEvent};

/// A recorded conversion job for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedConversion {
    /// The job that was submitted.
    pub job: ConversionJob,
    /// Whether the conversion succeeded.
    pub success: bool,
}

/// Mock implementation of the Converter trait.
///
/// Provides controllable behavior for testing:
/// - Track conversion jobs for assertions
/// - Fail selected items
/// - Simulate a conversion duration, honoring cancellation
///
/// Successful conversions write a small file at the job's output path.
#[derive(Debug)]
pub struct MockConverter {
    /// Recorded conversions.
    conversions: Arc<RwLock<Vec<RecordedConversion>>>,
    /// Item ids whose conversion fails.
    failing_items: Arc<RwLock<HashSet<String>>>,
    /// If set, the next conversion will fail with this error.
    next_error: Arc<RwLock<Option<ConverterError>>>,
    /// Simulated conversion duration.
    delay: Arc<RwLock<Duration>>,
    /// Whether validation reports the tools as present.
    available: Arc<RwLock<bool>>,
    concurrency: Arc<ConcurrencyProbe>,
}

impl Default for MockConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConverter {
    /// Create a new mock converter.
    pub fn new() -> Self {
        Self {
            conversions: Arc::new(RwLock::new(Vec::new())),
            failing_items: Arc::new(RwLock::new(HashSet::new())),
            next_error: Arc::new(RwLock::new(None)),
            delay: Arc::new(RwLock::new(Duration::from_millis(10))),
            available: Arc::new(RwLock::new(true)),
            concurrency: Arc::new(ConcurrencyProbe::default()),
        }
    }

    /// Get all recorded conversions.
    pub async fn recorded_conversions(&self) -> Vec<RecordedConversion> {
        self.conversions.read().await.clone()
    }

    /// Get the number of conversions performed.
    pub async fn conversion_count(&self) -> usize {
        self.conversions.read().await.len()
    }

    /// Make conversions of `item_id` fail.
    pub async fn fail_item(&self, item_id: impl Into<String>) {
        self.failing_items.write().await.insert(item_id.into());
    }

    /// Set the next conversion to fail with the given error.
    pub async fn set_next_error(&self, error: ConverterError) {
        *self.next_error.write().await = Some(error);
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = delay;
    }

    /// Make validation report missing tools.
    pub async fn set_available(&self, available: bool) {
        *self.available.write().await = available;
    }

    pub fn concurrency(&self) -> &ConcurrencyProbe {
        &self.concurrency
    }

    async fn record(&self, job: ConversionJob, success: bool) {
        self.conversions
            .write()
            .await
            .push(RecordedConversion { job, success });
    }
}

#[async_trait]
impl Converter for MockConverter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self, path: &Path) -> Result<MediaInfo, ConverterError> {
        if !path.exists() {
            return Err(ConverterError::InputNotFound {
                path: path.to_path_buf(),
            });
        }
        let mut info = MediaInfo::new(path, "webm");
        info.duration_secs = Some(180.0);
        info.has_audio = true;
        Ok(info)
    }

    async fn convert(
        &self,
        job: ConversionJob,
        ctx: &ProcessContext,
    ) -> Result<ConversionResult, ConverterError> {
        let _running = self.concurrency.enter();

        if let Some(error) = self.next_error.write().await.take() {
            self.record(job, false).await;
            return Err(error);
        }

        let delay = *self.delay.read().await;
        ctx.emit(ProcessEvent::PercentUpdate {
            percent: 50.0,
            overall: None,
        });
        if let Err(e) = simulate_process(ctx, "mock-converter", delay).await {
            self.record(job, false).await;
            return Err(e.into());
        }

        if self.failing_items.read().await.contains(&job.item_id) {
            self.record(job, false).await;
            return Err(ConverterError::conversion_failed(
                "simulated failure",
                Some("Invalid data found when processing input".to_string()),
            ));
        }

        if !job.input_path.exists() {
            self.record(job.clone(), false).await;
            return Err(ConverterError::InputNotFound {
                path: job.input_path,
            });
        }

        tokio::fs::create_dir_all(&job.output_dir).await?;
        let output_path = job.output_path();
        let body = format!("converted {}", job.item_id);
        tokio::fs::write(&output_path, &body).await?;
        ctx.emit(ProcessEvent::PercentUpdate {
            percent: 100.0,
            overall: None,
        });

        let result = ConversionResult {
            item_id: job.item_id.clone(),
            output_path,
            output_size_bytes: body.len() as u64,
            duration_ms: delay.as_millis() as u64,
            format: job.format,
        };
        self.record(job, true).await;
        Ok(result)
    }

    async fn validate(&self) -> Result<(), ConverterError> {
        if *self.available.read().await {
            Ok(())
        } else {
            Err(ConverterError::FfmpegNotFound {
                path: PathBuf::from("mock-ffmpeg"),
            })
        }
    }
}
