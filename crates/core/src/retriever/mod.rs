//! Retrieval of source media through an external downloader.
//!
//! The [`Retriever`] trait is the seam between the job runner and the
//! download tool. [`YtDlpRetriever`] drives a yt-dlp compatible CLI through
//! the shared [`ProcessDriver`](crate::process::ProcessDriver).

mod config;
mod error;
pub mod naming;
mod traits;
mod types;
mod ytdlp;

pub use config::RetrieverConfig;
pub use error::RetrieverError;
pub use traits::Retriever;
pub use types::{EntryInfo, RetrievalOutput, RetrievalRequest, SourceInfo};
pub use ytdlp::YtDlpRetriever;
