use std::{cmp::Ordering, collections::HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{error::AppError, storage::types::text_chunk::TextChunk};

/// A vector-search hit with its cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub chunk: TextChunk,
    pub score: f32,
}

/// Seam to whatever holds chunk embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces the vector stored for `chunk.id`.
    async fn upsert(&self, chunk: &TextChunk, vector: Vec<f32>) -> Result<(), AppError>;

    /// Nearest neighbours of `vector`, best first.
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, AppError>;

    /// Removes the given chunk ids. Unknown ids are ignored.
    async fn delete(&self, chunk_ids: &[String]) -> Result<(), AppError>;

    async fn count(&self) -> Result<usize, AppError>;
}

struct StoredVector {
    chunk: TextChunk,
    vector: Vec<f32>,
}

/// Brute-force cosine store held in process memory.
pub struct InMemoryVectorStore {
    dimension: usize,
    entries: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_dimension(&self, len: usize) -> Result<(), AppError> {
        if len == self.dimension {
            Ok(())
        } else {
            Err(AppError::Store(format!(
                "vector has {len} dimensions, store expects {}",
                self.dimension
            )))
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, chunk: &TextChunk, vector: Vec<f32>) -> Result<(), AppError> {
        self.check_dimension(vector.len())?;
        let mut entries = self.entries.write().await;
        entries.insert(
            chunk.id.clone(),
            StoredVector {
                chunk: chunk.clone(),
                vector,
            },
        );
        Ok(())
    }

    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, AppError> {
        self.check_dimension(vector.len())?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut scored: Vec<VectorMatch> = entries
            .values()
            .map(|stored| VectorMatch {
                chunk: stored.chunk.clone(),
                score: cosine_similarity(vector, &stored.vector),
            })
            .collect();
        drop(entries);

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        for id in chunk_ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, AppError> {
        Ok(self.entries.read().await.len())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, seq: usize) -> TextChunk {
        TextChunk::new(doc, seq, format!("chunk {seq}"), vec![])
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let store = InMemoryVectorStore::new(2);
        let near = chunk("doc", 0);
        let far = chunk("doc", 1);
        store.upsert(&near, vec![1.0, 0.1]).await.unwrap();
        store.upsert(&far, vec![0.0, 1.0]).await.unwrap();

        let hits = store.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, near.id);
        assert!(hits[0].score > hits[1].score);

        let limited = store.search(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(store.search(&[1.0, 0.0], 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_and_delete_removes() {
        let store = InMemoryVectorStore::new(2);
        let c = chunk("doc", 0);
        store.upsert(&c, vec![1.0, 0.0]).await.unwrap();
        store.upsert(&c, vec![0.0, 1.0]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let hits = store.search(&[0.0, 1.0], 1).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);

        store
            .delete(&[c.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_wrong_dimension() {
        let store = InMemoryVectorStore::new(3);
        let err = store.upsert(&chunk("doc", 0), vec![1.0]).await.unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
        assert!(store.search(&[1.0, 0.0], 3).await.is_err());
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).abs() < f32::EPSILON);
        assert!((cosine_similarity(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
