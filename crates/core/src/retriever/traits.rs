//! Trait definitions for the retriever module.

use async_trait::async_trait;

use super::error::RetrieverError;
use super::types::{RetrievalOutput, RetrievalRequest, SourceInfo};
use crate::process::ProcessContext;

/// Fetches source media for jobs.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Returns the name of this retriever implementation.
    fn name(&self) -> &str;

    /// Lists what a URL points at without downloading media.
    async fn probe(&self, url: &str, ctx: &ProcessContext) -> Result<SourceInfo, RetrieverError>;

    /// Downloads the requested media into `request.temp_dir`.
    ///
    /// File-done, percentage and skip events are delivered through `ctx`
    /// as they happen.
    async fn retrieve(
        &self,
        request: RetrievalRequest,
        ctx: &ProcessContext,
    ) -> Result<RetrievalOutput, RetrieverError>;
}
