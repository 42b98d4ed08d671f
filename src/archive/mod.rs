//! Fetching media items from the public archive.

pub mod captions;
pub mod client;
pub mod http;
pub mod license;
pub mod media;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod rate_limiter;
pub mod search;
pub(crate) mod tui;
pub mod worklist;

#[cfg(test)]
mod tests;

pub use client::{ArchiveClient, ArchiveError, ArchiveResult};
pub use http::{ArchiveClientConfig, ArchiveOrgClient};
pub use orchestrator::{FetchOrchestrator, RunSummary};
pub use pipeline::PipelineOptions;
pub use search::{MetadataScanner, SearchOptions, SearchSummary};
