use std::{
    cmp::Ordering,
    future::Future,
    time::{Duration, Instant},
};

use common::{error::AppError, storage::types::text_chunk::TextChunk};
use tracing::{debug, warn};

use super::{PipelineStageTimings, RetrievalEngine, RetrievalStrategy, StageKind};
use crate::{
    scoring::{fuse_min_max, sort_candidates, Scored},
    Degradation, FusionMethod, FusionRecord, HitSource, RerankStatus, RetrievalHit,
    RetrievalResult, RetrievedChunk, StrategyKind,
};

async fn with_timeout<T, F>(limit: Duration, label: &str, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
        Err(AppError::Timeout(format!(
            "{label} exceeded {}ms",
            limit.as_millis()
        )))
    })
}

async fn dense_candidates(
    engine: &RetrievalEngine,
    question: &str,
    take: usize,
) -> (Result<Vec<RetrievedChunk>, AppError>, Duration) {
    let started = Instant::now();
    let result = with_timeout(engine.tuning.strategy_timeout(), "dense retrieval", async {
        let vector = engine.embedder.embed(question).await?;
        let matches = engine.vectors.search(&vector, take).await?;
        let mut candidates: Vec<RetrievedChunk> =
            matches.into_iter().map(RetrievedChunk::from).collect();
        sort_candidates(&mut candidates);
        candidates.truncate(take);
        Ok(candidates)
    })
    .await;
    (result, started.elapsed())
}

async fn keyword_candidates(
    engine: &RetrievalEngine,
    question: &str,
    take: usize,
) -> (Result<Vec<RetrievedChunk>, AppError>, Duration) {
    let started = Instant::now();
    let result = with_timeout(engine.tuning.strategy_timeout(), "keyword retrieval", async {
        Ok(engine.keywords.search(question, take).await)
    })
    .await;
    (result, started.elapsed())
}

fn single_strategy_result(
    strategy: RetrievalStrategy,
    kind: StrategyKind,
    source: HitSource,
    candidates: Vec<RetrievedChunk>,
) -> RetrievalResult {
    let hits = candidates
        .into_iter()
        .map(|candidate| {
            let mut hit = RetrievalHit {
                chunk: candidate.chunk,
                score: candidate.score,
                source,
                scores: crate::scoring::Scores::default(),
            };
            match kind {
                StrategyKind::Dense => hit.scores.vector = Some(candidate.score),
                StrategyKind::Keyword => hit.scores.fts = Some(candidate.score),
            }
            hit
        })
        .collect();

    RetrievalResult {
        strategy,
        hits,
        contributors: vec![kind],
        fusion: None,
        rerank: RerankStatus::NotRequested,
        degradations: Vec::new(),
    }
}

pub(super) async fn dense(
    engine: &RetrievalEngine,
    question: &str,
    top_k: usize,
    timings: &mut PipelineStageTimings,
) -> Result<RetrievalResult, AppError> {
    let (result, elapsed) = dense_candidates(engine, question, top_k).await;
    timings.record(StageKind::Dense, elapsed);
    let candidates =
        result.map_err(|err| AppError::Retrieval(format!("dense strategy failed: {err}")))?;
    Ok(single_strategy_result(
        RetrievalStrategy::Dense,
        StrategyKind::Dense,
        HitSource::Dense,
        candidates,
    ))
}

pub(super) async fn bm25(
    engine: &RetrievalEngine,
    question: &str,
    top_k: usize,
    timings: &mut PipelineStageTimings,
) -> Result<RetrievalResult, AppError> {
    let (result, elapsed) = keyword_candidates(engine, question, top_k).await;
    timings.record(StageKind::Keyword, elapsed);
    let candidates =
        result.map_err(|err| AppError::Retrieval(format!("keyword strategy failed: {err}")))?;
    Ok(single_strategy_result(
        RetrievalStrategy::Bm25,
        StrategyKind::Keyword,
        HitSource::Keyword,
        candidates,
    ))
}

/// Output of the concurrent dense + keyword run, before truncation.
struct FusedRun {
    fused: Vec<Scored<TextChunk>>,
    contributors: Vec<StrategyKind>,
    degradations: Vec<Degradation>,
}

async fn fused_candidates(
    engine: &RetrievalEngine,
    question: &str,
    top_k: usize,
    timings: &mut PipelineStageTimings,
) -> Result<FusedRun, AppError> {
    let take = engine.tuning.candidate_take(top_k);
    let ((dense, dense_elapsed), (keyword, keyword_elapsed)) = tokio::join!(
        dense_candidates(engine, question, take),
        keyword_candidates(engine, question, take)
    );
    timings.record(StageKind::Dense, dense_elapsed);
    timings.record(StageKind::Keyword, keyword_elapsed);

    let mut contributors = Vec::with_capacity(2);
    let mut degradations = Vec::new();

    let (dense, keyword) = match (dense, keyword) {
        (Err(dense_err), Err(keyword_err)) => {
            return Err(AppError::Retrieval(format!(
                "all strategies failed; dense: {dense_err}; keyword: {keyword_err}"
            )));
        }
        (dense, keyword) => (dense, keyword),
    };

    let dense = match dense {
        Ok(list) => {
            contributors.push(StrategyKind::Dense);
            list
        }
        Err(err) => {
            warn!(error = %err, "Dense strategy failed, continuing with keyword results");
            degradations.push(Degradation::DenseFailed {
                cause: err.to_string(),
            });
            Vec::new()
        }
    };
    let keyword = match keyword {
        Ok(list) => {
            contributors.push(StrategyKind::Keyword);
            list
        }
        Err(err) => {
            warn!(error = %err, "Keyword strategy failed, continuing with dense results");
            degradations.push(Degradation::KeywordFailed {
                cause: err.to_string(),
            });
            Vec::new()
        }
    };

    let started = Instant::now();
    let fused = fuse_min_max(dense, keyword, engine.tuning.fusion_weights);
    timings.record(StageKind::Fuse, started.elapsed());
    debug!(candidates = fused.len(), "Fused candidate lists");

    Ok(FusedRun {
        fused,
        contributors,
        degradations,
    })
}

fn fused_hit(scored: Scored<TextChunk>) -> RetrievalHit {
    RetrievalHit {
        chunk: scored.item,
        score: scored.fused,
        source: HitSource::Hybrid,
        scores: scored.scores,
    }
}

fn hybrid_result(
    strategy: RetrievalStrategy,
    engine: &RetrievalEngine,
    run: FusedRun,
    hits: Vec<RetrievalHit>,
    rerank: RerankStatus,
) -> RetrievalResult {
    RetrievalResult {
        strategy,
        hits,
        contributors: run.contributors,
        fusion: Some(FusionRecord {
            method: FusionMethod::MinMaxLinear,
            weights: engine.tuning.fusion_weights.sanitized(),
        }),
        rerank,
        degradations: run.degradations,
    }
}

pub(super) async fn hybrid(
    engine: &RetrievalEngine,
    question: &str,
    top_k: usize,
    timings: &mut PipelineStageTimings,
) -> Result<RetrievalResult, AppError> {
    let mut run = fused_candidates(engine, question, top_k, timings).await?;
    let hits = std::mem::take(&mut run.fused)
        .into_iter()
        .take(top_k)
        .map(fused_hit)
        .collect();
    Ok(hybrid_result(
        RetrievalStrategy::Hybrid,
        engine,
        run,
        hits,
        RerankStatus::NotRequested,
    ))
}

pub(super) async fn hybrid_rerank(
    engine: &RetrievalEngine,
    question: &str,
    top_k: usize,
    timings: &mut PipelineStageTimings,
) -> Result<RetrievalResult, AppError> {
    let mut run = fused_candidates(engine, question, top_k, timings).await?;
    let mut pool = std::mem::take(&mut run.fused);
    pool.truncate(engine.tuning.rerank_pool(top_k).max(top_k));

    if pool.is_empty() {
        return Ok(hybrid_result(
            RetrievalStrategy::HybridRerank,
            engine,
            run,
            Vec::new(),
            RerankStatus::Skipped,
        ));
    }

    let started = Instant::now();
    let reranked = rerank_scores(engine, question, &pool).await;
    timings.record(StageKind::Rerank, started.elapsed());

    match reranked {
        Ok(scores) => {
            let mut hits: Vec<RetrievalHit> = pool
                .into_iter()
                .zip(scores)
                .map(|(scored, score)| {
                    let mut hit = fused_hit(scored);
                    hit.scores.rerank = Some(score);
                    hit.score = score;
                    hit.source = HitSource::Reranked;
                    hit
                })
                .collect();
            // Stable sort keeps fused order for equal rerank scores.
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            hits.truncate(top_k);
            Ok(hybrid_result(
                RetrievalStrategy::HybridRerank,
                engine,
                run,
                hits,
                RerankStatus::Applied,
            ))
        }
        Err(err) => {
            warn!(error = %err, "Rerank failed, returning fused ranking");
            run.degradations.push(Degradation::RerankFailed {
                cause: err.to_string(),
            });
            let hits = pool.into_iter().take(top_k).map(fused_hit).collect();
            Ok(hybrid_result(
                RetrievalStrategy::HybridRerank,
                engine,
                run,
                hits,
                RerankStatus::Degraded,
            ))
        }
    }
}

async fn rerank_scores(
    engine: &RetrievalEngine,
    question: &str,
    pool: &[Scored<TextChunk>],
) -> Result<Vec<f32>, AppError> {
    let reranker = engine
        .reranker
        .as_ref()
        .ok_or_else(|| AppError::Rerank("no reranker configured".to_string()))?;
    let documents: Vec<String> = pool
        .iter()
        .map(|scored| scored.item.indexable_text())
        .collect();
    let expected = documents.len();

    let scores = with_timeout(
        engine.tuning.rerank_timeout(),
        "rerank",
        reranker.rerank(question, documents),
    )
    .await?;

    if scores.len() != expected {
        return Err(AppError::Rerank(format!(
            "reranker returned {} scores for {expected} candidates",
            scores.len()
        )));
    }
    if scores.iter().any(|score| !score.is_finite()) {
        return Err(AppError::Rerank(
            "reranker returned a non-finite score".to_string(),
        ));
    }
    Ok(scores)
}
