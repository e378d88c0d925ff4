use std::{cmp::Ordering, collections::HashMap};

use common::storage::types::text_chunk::TextChunk;
use serde::{Deserialize, Serialize};

use crate::RetrievedChunk;

/// Holds optional subscores gathered from different retrieval signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub vector: Option<f32>,
    pub fts: Option<f32>,
    pub rerank: Option<f32>,
}

/// Generic wrapper combining an item with its accumulated retrieval scores.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub scores: Scores,
    pub fused: f32,
    /// Zero-based position in the dense ranking, if the item came from it.
    pub dense_rank: Option<usize>,
}

impl<T> Scored<T> {
    pub fn new(item: T) -> Self {
        Self {
            item,
            scores: Scores::default(),
            fused: 0.0,
            dense_rank: None,
        }
    }

    pub const fn with_vector_score(mut self, score: f32) -> Self {
        self.scores.vector = Some(score);
        self
    }

    pub const fn with_fts_score(mut self, score: f32) -> Self {
        self.scores.fts = Some(score);
        self
    }

    pub const fn update_fused(&mut self, fused: f32) {
        self.fused = fused;
    }
}

pub trait Identified {
    fn identifier(&self) -> &str;
}

impl Identified for TextChunk {
    fn identifier(&self) -> &str {
        &self.id
    }
}

/// Weights used for linear score fusion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub vector: f32,
    pub fts: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            vector: 0.5,
            fts: 0.5,
        }
    }
}

impl FusionWeights {
    pub fn new(vector: f32, fts: f32) -> Self {
        Self { vector, fts }.sanitized()
    }

    /// Negative or non-finite weights contribute nothing.
    #[must_use]
    pub fn sanitized(self) -> Self {
        let clean = |w: f32| if w.is_finite() { w.max(0.0) } else { 0.0 };
        Self {
            vector: clean(self.vector),
            fts: clean(self.fts),
        }
    }
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if min > max {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return scores
            .iter()
            .map(|score| if score.is_finite() { 1.0 } else { 0.0 })
            .collect();
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

/// Weighted sum of already-normalized subscores. A missing signal contributes zero.
pub fn fuse_scores(scores: &Scores, weights: FusionWeights) -> f32 {
    let vector = scores.vector.unwrap_or(0.0);
    let fts = scores.fts.unwrap_or(0.0);
    vector.mul_add(weights.vector, fts * weights.fts)
}

/// Orders by fused score, then by better dense rank (unranked last), then by id.
pub fn sort_by_fused_desc<T>(items: &mut [Scored<T>])
where
    T: Identified,
{
    items.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| compare_dense_rank(a.dense_rank, b.dense_rank))
            .then_with(|| a.item.identifier().cmp(b.item.identifier()))
    });
}

fn compare_dense_rank(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Raw ranking order for a single strategy: score descending, then id.
pub fn sort_candidates(candidates: &mut [RetrievedChunk]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Min-max normalizes each list on its own, then combines them linearly.
pub fn fuse_min_max(
    mut dense: Vec<RetrievedChunk>,
    mut keyword: Vec<RetrievedChunk>,
    weights: FusionWeights,
) -> Vec<Scored<TextChunk>> {
    let weights = weights.sanitized();
    sort_candidates(&mut dense);
    sort_candidates(&mut keyword);

    let dense_norm = min_max_normalize(&dense.iter().map(|c| c.score).collect::<Vec<_>>());
    let keyword_norm = min_max_normalize(&keyword.iter().map(|c| c.score).collect::<Vec<_>>());

    let mut merged: HashMap<String, Scored<TextChunk>> = HashMap::new();

    for (rank, (candidate, normalized)) in dense.into_iter().zip(dense_norm).enumerate() {
        let entry = merged
            .entry(candidate.chunk.id.clone())
            .or_insert_with(|| Scored::new(candidate.chunk));
        if entry.dense_rank.is_none() {
            entry.dense_rank = Some(rank);
            entry.scores.vector = Some(normalized);
        }
    }

    for (candidate, normalized) in keyword.into_iter().zip(keyword_norm) {
        let entry = merged
            .entry(candidate.chunk.id.clone())
            .or_insert_with(|| Scored::new(candidate.chunk));
        if entry.scores.fts.is_none() {
            entry.scores.fts = Some(normalized);
        }
    }

    let mut fused: Vec<Scored<TextChunk>> = merged
        .into_values()
        .map(|mut scored| {
            let value = fuse_scores(&scored.scores, weights);
            scored.update_fused(value);
            scored
        })
        .collect();
    sort_by_fused_desc(&mut fused);
    fused
}
