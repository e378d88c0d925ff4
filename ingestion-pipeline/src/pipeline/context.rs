use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{document::Document, progress_event::JobStage, text_chunk::TextChunk},
};
use tracing::{error, warn};

use super::{config::IngestionTuning, services::PipelineServices};

/// Receives stage progress as the pipeline advances.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, stage: JobStage, progress: u8, message: Option<String>);
}

/// Reporter that drops every update.
pub struct NoopReporter;

#[async_trait]
impl ProgressReporter for NoopReporter {
    async fn report(&self, _stage: JobStage, _progress: u8, _message: Option<String>) {}
}

pub struct PipelineContext<'a> {
    pub job_id: &'a str,
    pub document: &'a Document,
    pub tuning: &'a IngestionTuning,
    pub services: &'a dyn PipelineServices,
    pub reporter: &'a dyn ProgressReporter,
    pub chunks: Vec<TextChunk>,
    pub embeddings: Vec<Vec<f32>>,
    /// Ids handed to the vector store, recorded before each write is awaited.
    pub written_vectors: Vec<String>,
    pub written_keywords: Vec<String>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        job_id: &'a str,
        document: &'a Document,
        tuning: &'a IngestionTuning,
        services: &'a dyn PipelineServices,
        reporter: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            job_id,
            document,
            tuning,
            services,
            reporter,
            chunks: Vec::new(),
            embeddings: Vec::new(),
            written_vectors: Vec::new(),
            written_keywords: Vec::new(),
        }
    }

    pub async fn report_start(&self, stage: JobStage, message: impl Into<String>) {
        let (start, _) = stage.progress_bounds();
        self.reporter
            .report(stage, start, Some(message.into()))
            .await;
    }

    pub async fn report_done(&self, stage: JobStage, message: impl Into<String>) {
        let (start, done) = stage.progress_bounds();
        self.reporter
            .report(stage, done.unwrap_or(start), Some(message.into()))
            .await;
    }

    /// Removes every vector and keyword entry this job wrote. Failures are logged, not raised.
    pub async fn rollback(&mut self) {
        if !self.written_keywords.is_empty() {
            let ids = std::mem::take(&mut self.written_keywords);
            if let Err(err) = self.services.remove_keywords(&ids).await {
                warn!(job_id = %self.job_id, error = %err, "keyword rollback failed");
            }
        }
        if !self.written_vectors.is_empty() {
            let ids = std::mem::take(&mut self.written_vectors);
            if let Err(err) = self.services.delete_vectors(&ids).await {
                warn!(job_id = %self.job_id, error = %err, "vector rollback failed");
            }
        }
    }

    pub fn abort(&mut self, err: AppError) -> AppError {
        error!(
            job_id = %self.job_id,
            document_id = %self.document.id,
            error = %err,
            "ingestion pipeline aborted"
        );
        err
    }
}
