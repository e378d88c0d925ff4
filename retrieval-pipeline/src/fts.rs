use std::collections::{HashMap, HashSet};

use common::storage::types::text_chunk::TextChunk;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{scoring::sort_candidates, RetrievedChunk};

/// Term saturation.
pub const DEFAULT_K1: f32 = 1.5;
/// Length normalization.
pub const DEFAULT_B: f32 = 0.75;

struct IndexedChunk {
    chunk: TextChunk,
    term_freqs: HashMap<String, u32>,
    length: usize,
}

#[derive(Default)]
struct IndexState {
    chunks: HashMap<String, IndexedChunk>,
    postings: HashMap<String, HashSet<String>>,
    total_length: usize,
}

impl IndexState {
    fn add(&mut self, chunk: TextChunk) {
        self.remove(&chunk.id);

        let tokens = tokenize(&chunk.indexable_text());
        let length = tokens.len();
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            let count = term_freqs.entry(token).or_insert(0);
            *count = count.saturating_add(1);
        }
        for term in term_freqs.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(chunk.id.clone());
        }
        self.total_length = self.total_length.saturating_add(length);
        self.chunks.insert(
            chunk.id.clone(),
            IndexedChunk {
                chunk,
                term_freqs,
                length,
            },
        );
    }

    fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(previous) = self.chunks.remove(chunk_id) else {
            return false;
        };
        for term in previous.term_freqs.keys() {
            if let Some(ids) = self.postings.get_mut(term) {
                ids.remove(chunk_id);
                if ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_length = self.total_length.saturating_sub(previous.length);
        true
    }

    fn average_length(&self) -> f32 {
        if self.chunks.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.chunks.len() as f32
        }
    }
}

/// In-memory inverted index ranking chunks with Okapi BM25.
pub struct KeywordIndex {
    state: RwLock<IndexState>,
    k1: f32,
    b: f32,
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::with_parameters(DEFAULT_K1, DEFAULT_B)
    }

    pub fn with_parameters(k1: f32, b: f32) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            k1,
            b,
        }
    }

    /// Adds a chunk, replacing any entry with the same id.
    pub async fn insert(&self, chunk: TextChunk) {
        self.state.write().await.add(chunk);
    }

    /// Adds all chunks under a single write lock so readers never observe a partial batch.
    pub async fn insert_batch(&self, chunks: Vec<TextChunk>) {
        let mut state = self.state.write().await;
        for chunk in chunks {
            state.add(chunk);
        }
    }

    /// Returns how many of the ids were present.
    pub async fn remove(&self, chunk_ids: &[String]) -> usize {
        let mut state = self.state.write().await;
        chunk_ids.iter().filter(|id| state.remove(id)).count()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.chunks.is_empty()
    }

    pub async fn contains(&self, chunk_id: &str) -> bool {
        self.state.read().await.chunks.contains_key(chunk_id)
    }

    pub async fn clear(&self) {
        *self.state.write().await = IndexState::default();
    }

    /// Holds the write lock until the returned guard drops.
    #[cfg(test)]
    pub(crate) async fn hold_exclusive(&self) -> Box<dyn Send + '_> {
        Box::new(self.state.write().await)
    }

    /// Chunks scoring above zero for `query`, best first, at most `top_k`.
    pub async fn search(&self, query: &str, top_k: usize) -> Vec<RetrievedChunk> {
        let terms = tokenize(query);
        if terms.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let state = self.state.read().await;
        if state.chunks.is_empty() {
            return Vec::new();
        }

        let total = state.chunks.len() as f32;
        let avg_len = state.average_length().max(f32::EPSILON);
        let mut scores: HashMap<&str, f32> = HashMap::new();

        for term in &terms {
            let Some(ids) = state.postings.get(term) else {
                continue;
            };
            let doc_freq = ids.len() as f32;
            let idf = (1.0 + (total - doc_freq + 0.5) / (doc_freq + 0.5)).ln();

            for id in ids {
                let Some(indexed) = state.chunks.get(id) else {
                    continue;
                };
                let tf = indexed.term_freqs.get(term).copied().unwrap_or(0) as f32;
                let norm = self.k1 * (1.0 - self.b + self.b * indexed.length as f32 / avg_len);
                let contribution = idf * tf * (self.k1 + 1.0) / (tf + norm);
                *scores.entry(id.as_str()).or_insert(0.0) += contribution;
            }
        }

        let mut ranked: Vec<RetrievedChunk> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .filter_map(|(id, score)| {
                state.chunks.get(id).map(|indexed| RetrievedChunk {
                    chunk: indexed.chunk.clone(),
                    score,
                })
            })
            .collect();
        drop(state);

        sort_candidates(&mut ranked);
        ranked.truncate(top_k);
        debug!(terms = terms.len(), hits = ranked.len(), "Keyword search finished");
        ranked
    }
}

/// Lowercases and splits on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}
