//! Mock retriever for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{simulate_process, ConcurrencyProbe};
use crate::process::{ProcessContext, ProcessError, ProcessEvent, SkipReason};
use crate::retriever::naming::output_template;
use crate::retriever::{
    RetrievalOutput, RetrievalRequest, Retriever, RetrieverError, SourceInfo,
};

/// Scripted behavior of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockItem {
    /// Writes the file and announces it.
    Succeed,
    /// Reports an unavailable-content line and produces nothing.
    Skip(SkipReason),
    /// Reports an unavailable-content line, then still writes the file, as
    /// when a fallback format is fetched instead.
    SucceedAfterSkipLine(SkipReason),
    /// Exits with an error and produces nothing.
    Fail(String),
}

/// Mock implementation of the Retriever trait.
///
/// - Items succeed unless scripted otherwise with [`set_item`](Self::set_item)
/// - Whole-playlist requests produce `playlist_size` items
/// - Every invocation is recorded
#[derive(Debug)]
pub struct MockRetriever {
    /// Recorded retrieval requests.
    requests: Arc<RwLock<Vec<RetrievalRequest>>>,
    /// Per-index behavior.
    items: Arc<RwLock<HashMap<u32, MockItem>>>,
    /// Probe result; `None` makes probing fail.
    probe_result: Arc<RwLock<Option<SourceInfo>>>,
    /// Items produced by a whole-playlist invocation.
    playlist_size: Arc<RwLock<u32>>,
    /// Simulated duration of one invocation.
    delay: Arc<RwLock<Duration>>,
    concurrency: Arc<ConcurrencyProbe>,
}

impl Default for MockRetriever {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRetriever {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(RwLock::new(Vec::new())),
            items: Arc::new(RwLock::new(HashMap::new())),
            probe_result: Arc::new(RwLock::new(None)),
            playlist_size: Arc::new(RwLock::new(0)),
            delay: Arc::new(RwLock::new(Duration::from_millis(10))),
            concurrency: Arc::new(ConcurrencyProbe::default()),
        }
    }

    /// Get all recorded requests.
    pub async fn recorded_requests(&self) -> Vec<RetrievalRequest> {
        self.requests.read().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn set_item(&self, index: u32, item: MockItem) {
        self.items.write().await.insert(index, item);
    }

    pub async fn set_probe_result(&self, info: SourceInfo) {
        *self.probe_result.write().await = Some(info);
    }

    pub async fn set_playlist_size(&self, size: u32) {
        *self.playlist_size.write().await = size;
    }

    /// Set the simulated duration of each invocation.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = delay;
    }

    pub fn concurrency(&self) -> &ConcurrencyProbe {
        &self.concurrency
    }

    async fn item(&self, index: u32) -> MockItem {
        self.items
            .read()
            .await
            .get(&index)
            .cloned()
            .unwrap_or(MockItem::Succeed)
    }

    fn skip_line(index: u32, reason: SkipReason) -> String {
        format!(
            "ERROR: [media] vid{:03}: Video unavailable ({})",
            index,
            reason.as_str()
        )
    }

    async fn write_file(temp_dir: &Path, stem: &str, index: u32) -> Result<PathBuf, RetrieverError> {
        let name = output_template(stem)
            .replace("%(title).150B", &format!("Track {}", index))
            .replace("%(id)s", &format!("vid{:03}", index))
            .replace("%(ext)s", "webm");
        let path = temp_dir.join(name);
        tokio::fs::write(&path, format!("media {}", index)).await?;
        Ok(path)
    }

    /// Index of a per-item request.
    fn item_index(request: &RetrievalRequest) -> u32 {
        request
            .item_id
            .as_deref()
            .and_then(|id| id.rsplit('_').next())
            .and_then(|idx| idx.parse().ok())
            .or_else(|| request.selection.as_ref().and_then(|s| s.first().copied()))
            .unwrap_or(1)
    }

    async fn retrieve_item(
        &self,
        request: &RetrievalRequest,
        ctx: &ProcessContext,
    ) -> Result<RetrievalOutput, RetrieverError> {
        let index = Self::item_index(request);
        let stem = request
            .item_id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", request.job_id, index));

        let item = self.item(index).await;
        if let MockItem::SucceedAfterSkipLine(reason) = &item {
            ctx.emit(ProcessEvent::SkipHint {
                reason: *reason,
                line: Self::skip_line(index, *reason),
            });
        }

        match item {
            MockItem::Succeed | MockItem::SucceedAfterSkipLine(_) => {
                ctx.emit(ProcessEvent::PercentUpdate {
                    percent: 100.0,
                    overall: Some(100.0),
                });
                let path = Self::write_file(&request.temp_dir, &stem, index).await?;
                ctx.emit(ProcessEvent::FileDone {
                    path: path.clone(),
                    done: 1,
                    total: Some(1),
                });
                Ok(RetrievalOutput {
                    files: vec![path],
                    ..Default::default()
                })
            }
            MockItem::Skip(reason) => {
                ctx.emit(ProcessEvent::SkipHint {
                    reason,
                    line: Self::skip_line(index, reason),
                });
                Err(ProcessError::Failed {
                    program: "mock-retriever".to_string(),
                    code: Some(1),
                    stderr_tail: vec![Self::skip_line(index, reason)],
                    skipped: 1,
                    errors: 0,
                    skip_reason: Some(reason),
                }
                .into())
            }
            MockItem::Fail(message) => Err(ProcessError::Failed {
                program: "mock-retriever".to_string(),
                code: Some(1),
                stderr_tail: vec![format!("ERROR: {}", message)],
                skipped: 0,
                errors: 1,
                skip_reason: None,
            }
            .into()),
        }
    }

    async fn retrieve_playlist(
        &self,
        request: &RetrievalRequest,
        ctx: &ProcessContext,
    ) -> Result<RetrievalOutput, RetrieverError> {
        let size = *self.playlist_size.read().await;
        let mut output = RetrievalOutput::default();

        for index in 1..=size {
            match self.item(index).await {
                item @ (MockItem::Succeed | MockItem::SucceedAfterSkipLine(_)) => {
                    if let MockItem::SucceedAfterSkipLine(reason) = item {
                        output.skipped += 1;
                        output.skip_reasons.push(reason);
                        ctx.emit(ProcessEvent::SkipHint {
                            reason,
                            line: Self::skip_line(index, reason),
                        });
                    }
                    let stem = format!("{}_{}", request.job_id, index);
                    let path = Self::write_file(&request.temp_dir, &stem, index).await?;
                    output.files.push(path.clone());
                    ctx.emit(ProcessEvent::FileDone {
                        path,
                        done: output.files.len() as u32,
                        total: request.expected_total,
                    });
                    ctx.emit(ProcessEvent::PercentUpdate {
                        percent: 100.0,
                        overall: Some(index as f64 / size as f64 * 100.0),
                    });
                }
                MockItem::Skip(reason) => {
                    output.skipped += 1;
                    output.skip_reasons.push(reason);
                    ctx.emit(ProcessEvent::SkipHint {
                        reason,
                        line: Self::skip_line(index, reason),
                    });
                }
                MockItem::Fail(_) => output.errors += 1,
            }
        }

        if output.files.is_empty() {
            return Err(ProcessError::Failed {
                program: "mock-retriever".to_string(),
                code: Some(1),
                stderr_tail: vec!["ERROR: nothing downloaded".to_string()],
                skipped: output.skipped,
                errors: output.errors,
                skip_reason: output.skip_reasons.first().copied(),
            }
            .into());
        }
        Ok(output)
    }
}

#[async_trait]
impl Retriever for MockRetriever {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self, _url: &str, ctx: &ProcessContext) -> Result<SourceInfo, RetrieverError> {
        if ctx.cancel.is_cancelled() {
            return Err(ProcessError::Canceled.into());
        }
        self.probe_result
            .read()
            .await
            .clone()
            .ok_or_else(|| RetrieverError::probe_failed("no probe result configured"))
    }

    async fn retrieve(
        &self,
        request: RetrievalRequest,
        ctx: &ProcessContext,
    ) -> Result<RetrievalOutput, RetrieverError> {
        self.requests.write().await.push(request.clone());
        let _running = self.concurrency.enter();

        let delay = *self.delay.read().await;
        simulate_process(ctx, "mock-retriever", delay).await?;

        tokio::fs::create_dir_all(&request.temp_dir).await?;
        if request.item_id.is_some() {
            self.retrieve_item(&request, ctx).await
        } else {
            self.retrieve_playlist(&request, ctx).await
        }
    }
}
