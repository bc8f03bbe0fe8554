//! Per-item metadata resolution.
//!
//! Metadata for an item comes from several sources of decreasing trust:
//! the snapshot the client froze at submission, the provider's playlist
//! entries, an optional [`MetadataEnricher`], and finally the downloaded
//! file's name. Fields are merged one by one; the first non-empty value
//! wins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::converter::EmbeddedMetadata;
use crate::job::EntryMetadata;
use crate::pipeline::Limiter;
use crate::retriever::naming::{parse_output_name, ParsedName};
use crate::retriever::EntryInfo;

/// Descriptive fields of one item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl ItemMetadata {
    pub fn from_client(entry: &EntryMetadata) -> Self {
        Self {
            title: non_empty(entry.title.as_deref()),
            uploader: non_empty(entry.uploader.as_deref()),
            album: None,
        }
    }

    pub fn from_provider(entry: &EntryInfo) -> Self {
        Self {
            title: non_empty(entry.title.as_deref()),
            uploader: non_empty(entry.uploader.as_deref()),
            album: None,
        }
    }

    pub fn from_file_name(parsed: &ParsedName) -> Self {
        Self {
            title: non_empty(parsed.title.as_deref()),
            uploader: None,
            album: None,
        }
    }

    /// Fills fields missing in `self` from `lower`.
    pub fn merge(self, lower: ItemMetadata) -> Self {
        Self {
            title: self.title.or(lower.title),
            uploader: self.uploader.or(lower.uploader),
            album: self.album.or(lower.album),
        }
    }

    /// True when title and uploader are both known.
    pub fn is_complete(&self) -> bool {
        self.title.is_some() && self.uploader.is_some()
    }

    pub fn to_embedded(&self, track_number: Option<u32>) -> EmbeddedMetadata {
        EmbeddedMetadata {
            title: self.title.clone(),
            artist: self.uploader.clone(),
            album: self.album.clone(),
            track_number,
        }
    }
}

/// Client snapshot entry for an item: stable id first, then index.
pub fn client_entry_for<'a>(
    entries: &'a [EntryMetadata],
    index: u32,
    id: Option<&str>,
) -> Option<&'a EntryMetadata> {
    id.and_then(|id| entries.iter().find(|e| e.id.as_deref() == Some(id)))
        .or_else(|| entries.iter().find(|e| e.index == Some(index)))
}

/// Provider entry for an item: stable id first, then index.
pub fn provider_entry_for<'a>(
    entries: &'a [EntryInfo],
    index: u32,
    id: Option<&str>,
) -> Option<&'a EntryInfo> {
    id.and_then(|id| entries.iter().find(|e| e.id.as_deref() == Some(id)))
        .or_else(|| entries.iter().find(|e| e.index == index))
}

/// What is known about an item when asking an enricher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentQuery {
    pub job_id: String,
    pub index: u32,
    pub entry_id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
}

/// Best-effort external metadata lookup.
///
/// Failures are logged and ignored by the runner.
#[async_trait]
pub trait MetadataEnricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich(&self, query: &EnrichmentQuery) -> anyhow::Result<Option<ItemMetadata>>;
}

/// Resolves item metadata for one job.
pub struct MetadataResolver {
    job_id: String,
    client: Vec<EntryMetadata>,
    provider: Vec<EntryInfo>,
    album: Option<String>,
    enricher: Option<Arc<dyn MetadataEnricher>>,
    limiter: Limiter,
}

impl MetadataResolver {
    pub fn new(
        job_id: impl Into<String>,
        client: Vec<EntryMetadata>,
        provider: Vec<EntryInfo>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            client,
            provider,
            album: None,
            enricher: None,
            limiter: Limiter::new("enrich", 1),
        }
    }

    /// Album used when no source names one (the playlist title).
    pub fn with_album(mut self, album: Option<String>) -> Self {
        self.album = album;
        self
    }

    /// Enrichment lookups run through their own limiter of `concurrency`.
    pub fn with_enricher(
        mut self,
        enricher: Option<Arc<dyn MetadataEnricher>>,
        concurrency: usize,
    ) -> Self {
        self.enricher = enricher;
        self.limiter = Limiter::new("enrich", concurrency);
        self
    }

    /// Merged metadata for the item at `index` whose input is `input`.
    pub async fn resolve(
        &self,
        index: u32,
        entry: Option<&EntryInfo>,
        input: &Path,
    ) -> ItemMetadata {
        let parsed = parse_output_name(&self.job_id, input);
        let id = entry
            .and_then(|e| e.id.as_deref())
            .or(parsed.id.as_deref());

        let client = client_entry_for(&self.client, index, id)
            .map(ItemMetadata::from_client)
            .unwrap_or_default();
        let provider = entry
            .or_else(|| provider_entry_for(&self.provider, index, id))
            .map(ItemMetadata::from_provider)
            .unwrap_or_default();

        let mut merged = client.merge(provider);
        if !merged.is_complete() {
            if let Some(enriched) = self.enrich(index, id, &merged, &parsed).await {
                merged = merged.merge(enriched);
            }
        }

        let mut merged = merged.merge(ItemMetadata::from_file_name(&parsed));
        if merged.album.is_none() {
            merged.album = self.album.clone();
        }
        merged
    }

    async fn enrich(
        &self,
        index: u32,
        id: Option<&str>,
        known: &ItemMetadata,
        parsed: &ParsedName,
    ) -> Option<ItemMetadata> {
        let enricher = Arc::clone(self.enricher.as_ref()?);
        let query = EnrichmentQuery {
            job_id: self.job_id.clone(),
            index,
            entry_id: id.map(str::to_string),
            title: known.title.clone().or_else(|| parsed.title.clone()),
            uploader: known.uploader.clone(),
        };

        let ticket = self
            .limiter
            .run(async move { enricher.enrich(&query).await });
        match ticket.await {
            Ok(Ok(found)) => {
                debug!(job_id = %self.job_id, index, found = found.is_some(), "Enrichment finished");
                found
            }
            Ok(Err(e)) => {
                warn!(job_id = %self.job_id, index, error = %e, "Metadata enrichment failed");
                None
            }
            Err(e) => {
                warn!(job_id = %self.job_id, index, error = %e, "Metadata enrichment aborted");
                None
            }
        }
    }
}
