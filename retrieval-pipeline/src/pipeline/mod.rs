mod config;
mod strategies;

pub use config::{RetrievalStrategy, RetrievalTuning};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{error::AppError, storage::vector_store::VectorStore, utils::embedding::Embedder};
use tracing::{info, instrument};

use crate::{fts::KeywordIndex, reranking::Reranker, RetrievalResult};

// Stage type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Dense,
    Keyword,
    Fuse,
    Rerank,
}

// Pipeline stage timings tracker
#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    fn get_stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, d)| d.as_millis())
    }

    pub fn dense_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Dense)
    }

    pub fn keyword_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Keyword)
    }

    pub fn fuse_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Fuse)
    }

    pub fn rerank_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Rerank)
    }
}

/// Runs one of the closed set of retrieval strategies against the shared indexes.
pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    keywords: Arc<KeywordIndex>,
    reranker: Option<Arc<dyn Reranker>>,
    tuning: RetrievalTuning,
}

impl RetrievalEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        keywords: Arc<KeywordIndex>,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            embedder,
            vectors,
            keywords,
            reranker: None,
            tuning,
        }
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn tuning(&self) -> &RetrievalTuning {
        &self.tuning
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    /// Validates `top_k` and the question before any strategy runs.
    pub fn validate(question: &str, top_k: usize) -> Result<(), AppError> {
        if top_k == 0 {
            return Err(AppError::InvalidArgument(
                "top_k must be a positive integer".to_string(),
            ));
        }
        if question.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "question must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses the strategy selector, then retrieves.
    pub async fn retrieve_named(
        &self,
        question: &str,
        strategy: &str,
        top_k: usize,
    ) -> Result<RetrievalResult, AppError> {
        let strategy = strategy.parse::<RetrievalStrategy>()?;
        self.retrieve(question, strategy, top_k).await
    }

    #[instrument(skip_all, fields(strategy = %strategy, top_k))]
    pub async fn retrieve(
        &self,
        question: &str,
        strategy: RetrievalStrategy,
        top_k: usize,
    ) -> Result<RetrievalResult, AppError> {
        Self::validate(question, top_k)?;

        let started = Instant::now();
        let mut timings = PipelineStageTimings::default();
        let result = match strategy {
            RetrievalStrategy::Dense => strategies::dense(self, question, top_k, &mut timings).await,
            RetrievalStrategy::Bm25 => strategies::bm25(self, question, top_k, &mut timings).await,
            RetrievalStrategy::Hybrid => {
                strategies::hybrid(self, question, top_k, &mut timings).await
            }
            RetrievalStrategy::HybridRerank => {
                strategies::hybrid_rerank(self, question, top_k, &mut timings).await
            }
        }?;

        info!(
            hits = result.hits.len(),
            degraded = result.is_degraded(),
            dense_ms = timings.dense_ms(),
            keyword_ms = timings.keyword_ms(),
            fuse_ms = timings.fuse_ms(),
            rerank_ms = timings.rerank_ms(),
            elapsed_ms = started.elapsed().as_millis(),
            "Retrieval finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests;
