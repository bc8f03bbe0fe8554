//! Mock metadata enricher for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::runner::{EnrichmentQuery, ItemMetadata, MetadataEnricher};

/// Mock implementation of the MetadataEnricher trait.
///
/// Answers from a table keyed by playlist index.
#[derive(Debug, Default)]
pub struct MockEnricher {
    answers: Arc<RwLock<HashMap<u32, ItemMetadata>>>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MockEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_answer(&self, index: u32, metadata: ItemMetadata) {
        self.answers.write().await.insert(index, metadata);
    }

    /// Make every lookup fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataEnricher for MockEnricher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn enrich(&self, query: &EnrichmentQuery) -> anyhow::Result<Option<ItemMetadata>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("lookup service unavailable");
        }
        Ok(self.answers.read().await.get(&query.index).cloned())
    }
}
