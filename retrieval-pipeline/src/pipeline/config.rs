use common::{error::AppError, utils::config::AppConfig};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::scoring::FusionWeights;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Nearest neighbours by embedding similarity
    Dense,
    /// BM25 keyword ranking
    Bm25,
    /// Dense and BM25 run together and fused
    #[default]
    Hybrid,
    /// Hybrid candidates rescored by the cross-encoder
    HybridRerank,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Dense => "dense",
            RetrievalStrategy::Bm25 => "bm25",
            RetrievalStrategy::Hybrid => "hybrid",
            RetrievalStrategy::HybridRerank => "hybrid_rerank",
        }
    }
}

impl std::str::FromStr for RetrievalStrategy {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dense" | "vector" => Ok(Self::Dense),
            "bm25" | "keyword" => Ok(Self::Bm25),
            "hybrid" => Ok(Self::Hybrid),
            "hybrid_rerank" | "hybrid-rerank" => Ok(Self::HybridRerank),
            other => Err(AppError::InvalidArgument(format!(
                "unknown retrieval strategy '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunable parameters that govern each retrieval stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTuning {
    pub fusion_weights: FusionWeights,
    /// Each hybrid side fetches `top_k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    /// The reranker sees up to `top_k * rerank_headroom` fused candidates.
    pub rerank_headroom: usize,
    pub strategy_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            fusion_weights: FusionWeights::default(),
            candidate_multiplier: 3,
            rerank_headroom: 3,
            strategy_timeout_ms: 5_000,
            rerank_timeout_ms: 10_000,
        }
    }
}

impl RetrievalTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            fusion_weights: FusionWeights::new(config.dense_weight, config.keyword_weight),
            candidate_multiplier: config.candidate_multiplier,
            rerank_headroom: config.rerank_headroom,
            strategy_timeout_ms: config.strategy_timeout_ms,
            rerank_timeout_ms: config.rerank_timeout_ms,
        }
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }

    pub fn candidate_take(&self, top_k: usize) -> usize {
        top_k.saturating_mul(self.candidate_multiplier.max(1))
    }

    pub fn rerank_pool(&self, top_k: usize) -> usize {
        top_k.saturating_mul(self.rerank_headroom.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn parses_strategy_names() {
        assert_eq!(
            RetrievalStrategy::from_str("Hybrid-Rerank").unwrap(),
            RetrievalStrategy::HybridRerank
        );
        assert_eq!(
            RetrievalStrategy::from_str("keyword").unwrap(),
            RetrievalStrategy::Bm25
        );
        assert!(matches!(
            RetrievalStrategy::from_str("graph"),
            Err(AppError::InvalidArgument(_))
        ));
        assert_eq!(RetrievalStrategy::HybridRerank.to_string(), "hybrid_rerank");
    }

    #[test]
    fn candidate_sizes_never_shrink_below_top_k() {
        let tuning = RetrievalTuning {
            candidate_multiplier: 0,
            rerank_headroom: 0,
            ..RetrievalTuning::default()
        };
        assert_eq!(tuning.candidate_take(4), 4);
        assert_eq!(tuning.rerank_pool(4), 4);
        assert_eq!(RetrievalTuning::default().candidate_take(5), 15);
    }

    #[test]
    fn tuning_follows_config() {
        let config = AppConfig {
            dense_weight: 0.7,
            keyword_weight: 0.3,
            strategy_timeout_ms: 250,
            ..AppConfig::default()
        };
        let tuning = RetrievalTuning::from_config(&config);
        assert!((tuning.fusion_weights.vector - 0.7).abs() < f32::EPSILON);
        assert_eq!(tuning.strategy_timeout(), Duration::from_millis(250));
    }
}
