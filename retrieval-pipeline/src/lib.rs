pub mod answer_retrieval;
pub mod cache;
pub mod fts;
pub mod pipeline;
pub mod reranking;
pub mod scoring;

use common::storage::{types::text_chunk::TextChunk, vector_store::VectorMatch};
use serde::{Deserialize, Serialize};

pub use pipeline::{RetrievalEngine, RetrievalStrategy, RetrievalTuning};
use scoring::{FusionWeights, Scores};

// A chunk plus the raw score a single strategy assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: TextChunk,
    pub score: f32,
}

impl From<VectorMatch> for RetrievedChunk {
    fn from(value: VectorMatch) -> Self {
        Self {
            chunk: value.chunk,
            score: value.score,
        }
    }
}

/// The retrieval signals that can feed a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Dense,
    Keyword,
}

/// Which step produced a hit's final `score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Dense,
    Keyword,
    Hybrid,
    Reranked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub chunk: TextChunk,
    pub score: f32,
    pub source: HitSource,
    /// Per-signal breakdown. Fused hits carry normalized values.
    pub scores: Scores,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    MinMaxLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionRecord {
    pub method: FusionMethod,
    pub weights: FusionWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankStatus {
    NotRequested,
    Applied,
    /// Nothing to rerank.
    Skipped,
    /// Reranking failed and the fused ranking was returned instead.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    DenseFailed { cause: String },
    KeywordFailed { cause: String },
    RerankFailed { cause: String },
}

/// Ranked hits plus a record of how they were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub strategy: RetrievalStrategy,
    pub hits: Vec<RetrievalHit>,
    pub contributors: Vec<StrategyKind>,
    pub fusion: Option<FusionRecord>,
    pub rerank: RerankStatus,
    pub degradations: Vec<Degradation>,
}

impl RetrievalResult {
    pub fn empty(strategy: RetrievalStrategy) -> Self {
        Self {
            strategy,
            hits: Vec::new(),
            contributors: Vec::new(),
            fusion: None,
            rerank: RerankStatus::NotRequested,
            degradations: Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.hits.iter().map(|hit| hit.chunk.id.as_str()).collect()
    }
}
