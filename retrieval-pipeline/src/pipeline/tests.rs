use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        types::text_chunk::TextChunk,
        vector_store::{InMemoryVectorStore, VectorStore},
    },
    utils::embedding::{Embedder, EmbeddingProvider},
};

use super::*;
use crate::{
    fts::KeywordIndex, reranking::Reranker, Degradation, HitSource, RerankStatus, StrategyKind,
};

const DIMENSION: usize = 64;

const CORPUS: [&str; 5] = [
    "Rust borrow checker enforces ownership rules",
    "Tokio runtime schedules async tasks cooperatively",
    "BM25 ranks documents with term frequency statistics",
    "Ownership and borrowing make Rust memory safe",
    "Cosine similarity compares embedding vectors",
];

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AppError> {
        Err(AppError::Embedding("embedding service unavailable".into()))
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

struct SlowEmbedder;

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AppError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(vec![0.0; DIMENSION])
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    async fn rerank(&self, _query: &str, _documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        Err(AppError::Rerank("cross-encoder offline".into()))
    }
}

/// Scores later candidates higher, inverting the fused order.
struct ReversingReranker;

#[async_trait]
impl Reranker for ReversingReranker {
    async fn rerank(&self, _query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        Ok((0..documents.len()).map(|idx| idx as f32).collect())
    }
}

struct SlowReranker;

#[async_trait]
impl Reranker for SlowReranker {
    async fn rerank(&self, _query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(vec![1.0; documents.len()])
    }
}

struct Fixture {
    vectors: Arc<InMemoryVectorStore>,
    keywords: Arc<KeywordIndex>,
    chunks: Vec<TextChunk>,
}

impl Fixture {
    async fn seeded() -> Self {
        let provider = EmbeddingProvider::new_hashed(DIMENSION);
        let vectors = Arc::new(InMemoryVectorStore::new(DIMENSION));
        let keywords = Arc::new(KeywordIndex::new());
        let chunks: Vec<TextChunk> = CORPUS
            .iter()
            .enumerate()
            .map(|(seq, text)| TextChunk::new("corpus", seq, *text, vec![]))
            .collect();

        for chunk in &chunks {
            let vector = provider.embed(&chunk.indexable_text()).await.unwrap();
            vectors.upsert(chunk, vector).await.unwrap();
        }
        keywords.insert_batch(chunks.clone()).await;

        Self {
            vectors,
            keywords,
            chunks,
        }
    }

    fn empty() -> Self {
        Self {
            vectors: Arc::new(InMemoryVectorStore::new(DIMENSION)),
            keywords: Arc::new(KeywordIndex::new()),
            chunks: Vec::new(),
        }
    }

    fn engine(&self, embedder: Arc<dyn Embedder>) -> RetrievalEngine {
        self.engine_with_tuning(embedder, RetrievalTuning::default())
    }

    fn engine_with_tuning(
        &self,
        embedder: Arc<dyn Embedder>,
        tuning: RetrievalTuning,
    ) -> RetrievalEngine {
        RetrievalEngine::new(
            embedder,
            Arc::clone(&self.vectors) as Arc<dyn VectorStore>,
            Arc::clone(&self.keywords),
            tuning,
        )
    }
}

fn hashed() -> Arc<dyn Embedder> {
    Arc::new(EmbeddingProvider::new_hashed(DIMENSION))
}

fn ids(result: &crate::RetrievalResult) -> Vec<String> {
    result.hits.iter().map(|hit| hit.chunk.id.clone()).collect()
}

#[tokio::test]
async fn rejects_invalid_arguments() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(hashed());

    let err = engine
        .retrieve("ownership", RetrievalStrategy::Dense, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument(_)));

    let err = engine
        .retrieve("   ", RetrievalStrategy::Bm25, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument(_)));

    let err = engine
        .retrieve_named("ownership", "graph", 3)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument(_)));
}

#[tokio::test]
async fn empty_index_returns_empty_results() {
    let fixture = Fixture::empty();
    let engine = fixture
        .engine(hashed())
        .with_reranker(Arc::new(ReversingReranker));

    for strategy in [
        RetrievalStrategy::Dense,
        RetrievalStrategy::Bm25,
        RetrievalStrategy::Hybrid,
        RetrievalStrategy::HybridRerank,
    ] {
        let result = engine.retrieve("anything", strategy, 5).await.unwrap();
        assert!(result.is_empty(), "{strategy} should be empty");
        assert!(!result.is_degraded());
        assert_eq!(result.strategy, strategy);
    }
}

#[tokio::test]
async fn dense_respects_top_k_and_orders_by_similarity() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(hashed());

    let result = engine
        .retrieve("cosine similarity embedding vectors", RetrievalStrategy::Dense, 2)
        .await
        .unwrap();

    assert_eq!(result.len(), 2);
    assert_eq!(result.hits[0].chunk.id, fixture.chunks[4].id);
    assert!(result.hits[0].score >= result.hits[1].score);
    assert!(result.hits.iter().all(|hit| hit.source == HitSource::Dense));
    assert_eq!(result.contributors, vec![StrategyKind::Dense]);
    assert!(result.fusion.is_none());
}

#[tokio::test]
async fn bm25_only_returns_matching_chunks() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(hashed());

    let result = engine
        .retrieve("ownership", RetrievalStrategy::Bm25, 10)
        .await
        .unwrap();

    let mut found = ids(&result);
    found.sort();
    let mut expected = vec![fixture.chunks[0].id.clone(), fixture.chunks[3].id.clone()];
    expected.sort();
    assert_eq!(found, expected);
    assert!(result.hits.iter().all(|hit| hit.source == HitSource::Keyword));
}

#[tokio::test]
async fn hybrid_fuses_both_strategies() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(hashed());

    let result = engine
        .retrieve("rust ownership", RetrievalStrategy::Hybrid, 3)
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(
        result.contributors,
        vec![StrategyKind::Dense, StrategyKind::Keyword]
    );
    assert!(result.fusion.is_some());
    assert!(!result.is_degraded());
    assert!(result
        .hits
        .windows(2)
        .all(|pair| pair[0].score >= pair[1].score));
    let top_two: Vec<&str> = result.hits[..2].iter().map(|h| h.chunk.id.as_str()).collect();
    assert!(top_two.contains(&fixture.chunks[0].id.as_str()));
    assert!(top_two.contains(&fixture.chunks[3].id.as_str()));
}

#[tokio::test]
async fn hybrid_is_deterministic() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(hashed());

    let first = engine
        .retrieve("rust async tasks", RetrievalStrategy::Hybrid, 5)
        .await
        .unwrap();
    for _ in 0..5 {
        let again = engine
            .retrieve("rust async tasks", RetrievalStrategy::Hybrid, 5)
            .await
            .unwrap();
        assert_eq!(first, again);
    }
}

#[tokio::test]
async fn hybrid_degrades_to_keyword_when_dense_fails() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(Arc::new(FailingEmbedder));

    let result = engine
        .retrieve("ownership", RetrievalStrategy::Hybrid, 5)
        .await
        .unwrap();

    assert!(result.is_degraded());
    assert!(matches!(
        result.degradations.as_slice(),
        [Degradation::DenseFailed { .. }]
    ));
    assert_eq!(result.contributors, vec![StrategyKind::Keyword]);
    assert_eq!(result.len(), 2);
}

#[tokio::test]
async fn dense_failure_is_a_retrieval_error() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(Arc::new(FailingEmbedder));

    let err = engine
        .retrieve("ownership", RetrievalStrategy::Dense, 5)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Retrieval(_)));
    assert!(err.is_retryable());
}

#[tokio::test(start_paused = true)]
async fn dense_timeout_degrades_hybrid() {
    let fixture = Fixture::seeded().await;
    let tuning = RetrievalTuning {
        strategy_timeout_ms: 50,
        ..RetrievalTuning::default()
    };
    let engine = fixture.engine_with_tuning(Arc::new(SlowEmbedder), tuning);

    let result = engine
        .retrieve("ownership", RetrievalStrategy::Hybrid, 5)
        .await
        .unwrap();

    match result.degradations.as_slice() {
        [Degradation::DenseFailed { cause }] => assert!(cause.contains("exceeded")),
        other => panic!("unexpected degradations: {other:?}"),
    }
    assert_eq!(result.contributors, vec![StrategyKind::Keyword]);
}

#[tokio::test(start_paused = true)]
async fn both_strategies_failing_fails_the_query() {
    let fixture = Fixture::seeded().await;
    let tuning = RetrievalTuning {
        strategy_timeout_ms: 50,
        ..RetrievalTuning::default()
    };
    let engine = fixture.engine_with_tuning(Arc::new(FailingEmbedder), tuning);

    let guard = fixture.keywords.hold_exclusive().await;
    let err = engine
        .retrieve("ownership", RetrievalStrategy::Hybrid, 5)
        .await
        .unwrap_err();
    drop(guard);

    assert!(matches!(err, AppError::Retrieval(_)));
}

#[tokio::test(start_paused = true)]
async fn keyword_timeout_degrades_hybrid() {
    let fixture = Fixture::seeded().await;
    let tuning = RetrievalTuning {
        strategy_timeout_ms: 50,
        ..RetrievalTuning::default()
    };
    let engine = fixture.engine_with_tuning(hashed(), tuning);

    let guard = fixture.keywords.hold_exclusive().await;
    let result = engine
        .retrieve("ownership", RetrievalStrategy::Hybrid, 5)
        .await
        .unwrap();
    drop(guard);

    assert!(matches!(
        result.degradations.as_slice(),
        [Degradation::KeywordFailed { .. }]
    ));
    assert_eq!(result.contributors, vec![StrategyKind::Dense]);
    assert_eq!(result.len(), 5);
}

#[tokio::test]
async fn failing_reranker_matches_hybrid_ordering() {
    let fixture = Fixture::seeded().await;
    let plain = fixture.engine(hashed());
    let reranking = fixture
        .engine(hashed())
        .with_reranker(Arc::new(FailingReranker));

    let hybrid = plain
        .retrieve("rust ownership memory", RetrievalStrategy::Hybrid, 3)
        .await
        .unwrap();
    let degraded = reranking
        .retrieve("rust ownership memory", RetrievalStrategy::HybridRerank, 3)
        .await
        .unwrap();

    assert_eq!(ids(&hybrid), ids(&degraded));
    assert_eq!(degraded.rerank, RerankStatus::Degraded);
    assert!(degraded.is_degraded());
    assert!(matches!(
        degraded.degradations.as_slice(),
        [Degradation::RerankFailed { .. }]
    ));
    assert_eq!(degraded.strategy, RetrievalStrategy::HybridRerank);
}

#[tokio::test]
async fn missing_reranker_degrades_like_a_failure() {
    let fixture = Fixture::seeded().await;
    let engine = fixture.engine(hashed());
    assert!(!engine.has_reranker());

    let result = engine
        .retrieve("rust", RetrievalStrategy::HybridRerank, 2)
        .await
        .unwrap();
    assert_eq!(result.rerank, RerankStatus::Degraded);
    assert_eq!(result.len(), 2);
}

#[tokio::test]
async fn reranker_reorders_candidate_pool() {
    let fixture = Fixture::seeded().await;
    let plain = fixture.engine(hashed());
    let reranking = fixture
        .engine(hashed())
        .with_reranker(Arc::new(ReversingReranker));

    let fused = plain
        .retrieve("rust ownership", RetrievalStrategy::Hybrid, 5)
        .await
        .unwrap();
    let reranked = reranking
        .retrieve("rust ownership", RetrievalStrategy::HybridRerank, 2)
        .await
        .unwrap();

    assert_eq!(reranked.rerank, RerankStatus::Applied);
    assert!(!reranked.is_degraded());
    assert_eq!(reranked.len(), 2);
    assert!(reranked
        .hits
        .iter()
        .all(|hit| hit.source == HitSource::Reranked && hit.scores.rerank.is_some()));
    // The reversing reranker favours the tail of the fused pool.
    assert_eq!(
        reranked.hits[0].chunk.id,
        fused.hits.last().unwrap().chunk.id
    );
}

#[tokio::test(start_paused = true)]
async fn slow_reranker_times_out_and_degrades() {
    let fixture = Fixture::seeded().await;
    let tuning = RetrievalTuning {
        rerank_timeout_ms: 100,
        ..RetrievalTuning::default()
    };
    let engine = fixture
        .engine_with_tuning(hashed(), tuning)
        .with_reranker(Arc::new(SlowReranker));

    let result = engine
        .retrieve("rust", RetrievalStrategy::HybridRerank, 2)
        .await
        .unwrap();
    assert_eq!(result.rerank, RerankStatus::Degraded);
}
