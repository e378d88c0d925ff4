mod config;
mod context;
mod services;
mod stages;
mod state;

pub use config::{IngestionConfig, IngestionTuning, OrchestratorLimits};
pub use context::{NoopReporter, ProgressReporter};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{error::AppError, storage::types::document::Document};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use self::{
    context::PipelineContext,
    stages::{chunk, embed, index_keywords, index_vectors},
    state::ready,
};

/// Drives one document through chunk, embed, vector and keyword indexing.
///
/// A failed, cancelled or timed out run leaves no vectors or keyword entries behind.
#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    tuning: IngestionTuning,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn new(services: Arc<dyn PipelineServices>, tuning: IngestionTuning) -> Self {
        Self { tuning, services }
    }

    pub fn tuning(&self) -> &IngestionTuning {
        &self.tuning
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the number of chunks indexed.
    #[instrument(skip_all, fields(job_id = %job_id, document_id = %document.id, kind = %document.kind))]
    pub async fn process(
        &self,
        job_id: &str,
        document: &Document,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<usize, AppError> {
        let deadline = tokio::time::Instant::now() + self.tuning.job_timeout;
        let mut ctx = PipelineContext::new(
            job_id,
            document,
            &self.tuning,
            self.services.as_ref(),
            reporter,
        );
        let guard = StageGuard {
            cancel,
            deadline,
            timeout: self.tuning.job_timeout,
        };

        let pipeline_started = Instant::now();
        let machine = ready();

        let stage_start = Instant::now();
        let outcome = guard.run(chunk(machine, &mut ctx)).await;
        let machine = match outcome {
            Ok(machine) => machine,
            Err(err) => return Err(Self::fail(&mut ctx, err).await),
        };
        let chunk_ms = Self::duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let outcome = guard.run(embed(machine, &mut ctx)).await;
        let machine = match outcome {
            Ok(machine) => machine,
            Err(err) => return Err(Self::fail(&mut ctx, err).await),
        };
        let embed_ms = Self::duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let outcome = guard.run(index_vectors(machine, &mut ctx)).await;
        let machine = match outcome {
            Ok(machine) => machine,
            Err(err) => return Err(Self::fail(&mut ctx, err).await),
        };
        let vector_ms = Self::duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let outcome = guard.run(index_keywords(machine, &mut ctx)).await;
        let _machine = match outcome {
            Ok(machine) => machine,
            Err(err) => return Err(Self::fail(&mut ctx, err).await),
        };
        let keyword_ms = Self::duration_millis(stage_start.elapsed());

        let chunk_count = ctx.chunks.len();
        info!(
            job_id = %job_id,
            chunk_count,
            total_ms = Self::duration_millis(pipeline_started.elapsed()),
            chunk_ms,
            embed_ms,
            vector_ms,
            keyword_ms,
            "ingestion pipeline finished"
        );
        Ok(chunk_count)
    }

    async fn fail(ctx: &mut PipelineContext<'_>, err: AppError) -> AppError {
        ctx.rollback().await;
        match err {
            AppError::Cancelled(_) => {
                info!(job_id = %ctx.job_id, "ingestion pipeline cancelled");
                err
            }
            err => ctx.abort(err),
        }
    }
}

/// Races a stage against cancellation and the job deadline.
struct StageGuard<'a> {
    cancel: &'a CancellationToken,
    deadline: tokio::time::Instant,
    timeout: Duration,
}

impl StageGuard<'_> {
    async fn run<T, F>(&self, stage: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                Err(AppError::Cancelled("job cancelled while running".to_string()))
            }
            outcome = tokio::time::timeout_at(self.deadline, stage) => {
                outcome.unwrap_or_else(|_| {
                    Err(AppError::Timeout(format!(
                        "job exceeded {}s",
                        self.timeout.as_secs()
                    )))
                })
            }
        }
    }
}
