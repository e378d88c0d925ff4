use std::sync::Arc;

use async_trait::async_trait;
use common::error::AppError;
use futures::Stream;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::{
    cache::{CacheKey, CacheStats, QueryCache},
    RetrievalEngine, RetrievalHit, RetrievalResult, RetrievalStrategy,
};

pub const NO_ANSWER_MESSAGE: &str =
    "I couldn't find relevant information to answer your question.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerReference {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub content: String,
    pub references: Vec<AnswerReference>,
    pub retrieval: RetrievalResult,
}

/// Incremental updates for a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Retrieved { result: RetrievalResult },
    Answer { answer: Answer },
    Error { message: String, retryable: bool },
}

/// Turns retrieved context into answer text.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, question: &str, hits: &[RetrievalHit]) -> Result<String, AppError>;
}

/// Quotes the best hits back instead of calling a language model.
pub struct ExtractiveAnswerGenerator {
    max_sources: usize,
    preview_chars: usize,
}

impl Default for ExtractiveAnswerGenerator {
    fn default() -> Self {
        Self {
            max_sources: 3,
            preview_chars: 200,
        }
    }
}

impl ExtractiveAnswerGenerator {
    pub fn new(max_sources: usize, preview_chars: usize) -> Self {
        Self {
            max_sources: max_sources.max(1),
            preview_chars: preview_chars.max(1),
        }
    }

    fn preview(&self, text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.chars().count() > self.preview_chars {
            let head: String = trimmed.chars().take(self.preview_chars).collect();
            format!("{head}...")
        } else {
            trimmed.to_string()
        }
    }
}

#[async_trait]
impl AnswerGenerator for ExtractiveAnswerGenerator {
    async fn generate(&self, question: &str, hits: &[RetrievalHit]) -> Result<String, AppError> {
        if hits.is_empty() {
            return Ok(NO_ANSWER_MESSAGE.to_string());
        }

        let sources: Vec<String> = hits
            .iter()
            .take(self.max_sources)
            .enumerate()
            .map(|(idx, hit)| {
                let heading = hit
                    .chunk
                    .title_path()
                    .map(|path| format!("{path}: "))
                    .unwrap_or_default();
                format!(
                    "[{}] {heading}{} (score: {:.2})",
                    idx.saturating_add(1),
                    self.preview(&hit.chunk.text),
                    hit.score
                )
            })
            .collect();

        Ok(format!(
            "Relevant passages for '{}':\n\n{}",
            question.trim(),
            sources.join("\n")
        ))
    }
}

fn references(hits: &[RetrievalHit]) -> Vec<AnswerReference> {
    hits.iter()
        .map(|hit| AnswerReference {
            chunk_id: hit.chunk.id.clone(),
            document_id: hit.chunk.document_id.clone(),
            sequence: hit.chunk.sequence,
            score: hit.score,
        })
        .collect()
}

/// Query entry point: validation, cache lookup, retrieval and answering.
pub struct QueryService {
    engine: Arc<RetrievalEngine>,
    cache: Option<Arc<QueryCache>>,
    generator: Arc<dyn AnswerGenerator>,
}

impl QueryService {
    pub fn new(
        engine: Arc<RetrievalEngine>,
        cache: Option<Arc<QueryCache>>,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Self {
        Self {
            engine,
            cache,
            generator,
        }
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    /// Drops cached results, e.g. after the indexes changed.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    #[instrument(skip_all, fields(strategy = %strategy, top_k))]
    pub async fn query(
        &self,
        question: &str,
        strategy: RetrievalStrategy,
        top_k: usize,
    ) -> Result<RetrievalResult, AppError> {
        RetrievalEngine::validate(question, top_k)?;

        let key = CacheKey::new(question, strategy, top_k);
        let mut epoch = None;
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key) {
                debug!("Query cache hit");
                return Ok(hit);
            }
            epoch = Some(cache.epoch());
        }

        let result = self.engine.retrieve(question, strategy, top_k).await?;

        // Best-effort results are not worth replaying once the degraded dependency recovers.
        if let (Some(cache), Some(epoch)) = (&self.cache, epoch) {
            if !result.is_degraded() {
                cache.put_since(epoch, key, result.clone());
            }
        }
        Ok(result)
    }

    pub async fn answer(
        &self,
        question: &str,
        strategy: RetrievalStrategy,
        top_k: usize,
    ) -> Result<Answer, AppError> {
        let retrieval = self.query(question, strategy, top_k).await?;
        self.compose(question, retrieval).await
    }

    async fn compose(&self, question: &str, retrieval: RetrievalResult) -> Result<Answer, AppError> {
        let content = self.generator.generate(question, &retrieval.hits).await?;
        Ok(Answer {
            content,
            references: references(&retrieval.hits),
            retrieval,
        })
    }

    /// Emits the retrieval result as soon as it is ready, then the answer.
    pub fn answer_stream<'a>(
        &'a self,
        question: &'a str,
        strategy: RetrievalStrategy,
        top_k: usize,
    ) -> impl Stream<Item = QueryEvent> + Send + 'a {
        async_stream::stream! {
            let retrieval = match self.query(question, strategy, top_k).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(error = %err, "Streaming query failed during retrieval");
                    yield QueryEvent::Error { message: err.to_string(), retryable: err.is_retryable() };
                    return;
                }
            };
            yield QueryEvent::Retrieved { result: retrieval.clone() };

            match self.compose(question, retrieval).await {
                Ok(answer) => yield QueryEvent::Answer { answer },
                Err(err) => {
                    warn!(error = %err, "Streaming query failed during answer generation");
                    yield QueryEvent::Error { message: err.to_string(), retryable: err.is_retryable() };
                }
            }
        }
    }
}
