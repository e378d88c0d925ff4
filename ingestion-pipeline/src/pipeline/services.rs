use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        types::{document::Document, text_chunk::TextChunk},
        vector_store::VectorStore,
    },
    utils::embedding::Embedder,
};
use retrieval_pipeline::fts::KeywordIndex;

use crate::utils::chunking::Chunker;

/// Collaborator calls made by the pipeline stages.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn chunk_document(&self, document: &Document) -> Result<Vec<TextChunk>, AppError>;

    async fn embed_chunk(&self, chunk: &TextChunk) -> Result<Vec<f32>, AppError>;

    async fn upsert_vector(&self, chunk: &TextChunk, embedding: Vec<f32>)
        -> Result<(), AppError>;

    async fn delete_vectors(&self, chunk_ids: &[String]) -> Result<(), AppError>;

    async fn index_keywords(&self, chunks: Vec<TextChunk>) -> Result<(), AppError>;

    async fn remove_keywords(&self, chunk_ids: &[String]) -> Result<(), AppError>;
}

pub struct DefaultPipelineServices {
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    keywords: Arc<KeywordIndex>,
}

impl DefaultPipelineServices {
    pub fn new(
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        keywords: Arc<KeywordIndex>,
    ) -> Self {
        Self {
            chunker,
            embedder,
            vectors,
            keywords,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn chunk_document(&self, document: &Document) -> Result<Vec<TextChunk>, AppError> {
        self.chunker.chunk(document).await
    }

    async fn embed_chunk(&self, chunk: &TextChunk) -> Result<Vec<f32>, AppError> {
        let embedding = self.embedder.embed(&chunk.indexable_text()).await?;
        let expected = self.embedder.dimension();
        if embedding.len() != expected {
            return Err(AppError::Embedding(format!(
                "embedding for chunk {} has {} dimensions, expected {expected}",
                chunk.id,
                embedding.len()
            )));
        }
        Ok(embedding)
    }

    async fn upsert_vector(
        &self,
        chunk: &TextChunk,
        embedding: Vec<f32>,
    ) -> Result<(), AppError> {
        self.vectors.upsert(chunk, embedding).await
    }

    async fn delete_vectors(&self, chunk_ids: &[String]) -> Result<(), AppError> {
        self.vectors.delete(chunk_ids).await
    }

    async fn index_keywords(&self, chunks: Vec<TextChunk>) -> Result<(), AppError> {
        self.keywords.insert_batch(chunks).await;
        Ok(())
    }

    async fn remove_keywords(&self, chunk_ids: &[String]) -> Result<(), AppError> {
        self.keywords.remove(chunk_ids).await;
        Ok(())
    }
}
