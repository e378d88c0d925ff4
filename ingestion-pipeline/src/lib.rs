#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod utils;

pub use orchestrator::JobOrchestrator;
pub use pipeline::{
    DefaultPipelineServices, IngestionConfig, IngestionPipeline, IngestionTuning,
    OrchestratorLimits,
};
pub use progress::ProgressStreamer;
pub use utils::chunking::{Chunker, TextSplitterChunker};
