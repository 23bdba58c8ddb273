//! YouTube channel ingestion
//!
//! Discovers recent items of a channel, filters out shorts and items already
//! imported, and fetches transcripts and chapters through a rotating pool of
//! egress proxies with bounded retries and method fallback.

pub mod config;
pub mod error;
pub mod extraction;
pub mod filters;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod storage;
pub mod youtube;

// Re-export main types for easy access
pub use crate::config::{Config, ConfigBuilder, ImportSettings};
pub use crate::error::{FetchError, IngestError, Result};
pub use crate::extraction::{
    Chapter, ExtractedItem, ExtractionAttempt, Extractor, LanguagePreference, RetryPolicy, Transcript,
    TranscriptSegment,
};
pub use crate::filters::MetadataLookup;
pub use crate::pipeline::{CandidateItem, ChannelPipeline, Discovery, ImportProgress, ImportResult, ImportStage};
pub use crate::pool::{AddressIdentity, AddressPool, PoolStatus};
pub use crate::storage::{ImportRecord, JsonFileStorage, MemoryStorage, Storage};
