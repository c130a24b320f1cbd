//! Listing change processing.
//!
//! [`IngestLoop`] pulls events off a channel; [`MatchPipeline`] does the
//! per-event work.

pub mod ingest;
pub mod pipeline;

pub use ingest::{IngestConfig, IngestLoop, IngestStats};
pub use pipeline::{EventReport, MatchPipeline, PipelineConfig, StoreFailure};
