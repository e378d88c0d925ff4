use std::{future::Future, time::Duration};

use common::{
    error::AppError,
    storage::types::{progress_event::JobStage, text_chunk::TextChunk},
};
use futures::{stream, StreamExt};
use state_machines::core::GuardError;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{debug, instrument, warn};

use super::{
    config::IngestionTuning,
    context::PipelineContext,
    state::{Chunked, Embedded, IngestionMachine, KeywordsIndexed, Ready, VectorsIndexed},
};
use crate::utils::chunking::validate_chunks;

/// Runs `action` until it succeeds, fails with a non-transient error or runs out of attempts.
pub(super) async fn with_retry<T, F, Fut>(
    tuning: &IngestionTuning,
    operation: &'static str,
    action: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    // Delays grow as base, 2x base, 4x base ... before jitter.
    let retry_strategy = ExponentialBackoff::from_millis(2)
        .factor((tuning.retry_base_delay_ms / 2).max(1))
        .max_delay(Duration::from_millis(tuning.retry_max_delay_ms))
        .map(jitter)
        .take(tuning.max_attempts.saturating_sub(1));

    RetryIf::spawn(retry_strategy, action, |err: &AppError| {
        let retry = err.is_retryable();
        if retry {
            warn!(operation, error = %err, "transient ingestion failure; retrying");
        }
        retry
    })
    .await
}

/// Progress inside a stage's start..done window after `done` of `total` items.
fn interpolate(stage: JobStage, done: usize, total: usize) -> u8 {
    let (start, end) = stage.progress_bounds();
    let end = end.unwrap_or(start);
    if total == 0 {
        return start;
    }
    let span = usize::from(end.saturating_sub(start));
    let offset = span.saturating_mul(done) / total;
    let value = usize::from(start).saturating_add(offset);
    u8::try_from(value).unwrap_or(end).min(end)
}

#[instrument(level = "trace", skip_all, fields(job_id = %ctx.job_id))]
pub async fn chunk(
    machine: IngestionMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Chunked>, AppError> {
    ctx.report_start(JobStage::Chunking, "chunking document")
        .await;

    let services = ctx.services;
    let document = ctx.document;
    let chunks = with_retry(ctx.tuning, "chunk", || services.chunk_document(document)).await?;
    validate_chunks(&document.id, &chunks)?;
    let chunks: Vec<TextChunk> = chunks
        .into_iter()
        .map(|chunk| chunk.scoped_to(ctx.job_id))
        .collect();

    debug!(
        job_id = %ctx.job_id,
        document_id = %document.id,
        chunk_count = chunks.len(),
        "document chunked"
    );
    let message = format!("produced {} chunks", chunks.len());
    ctx.chunks = chunks;
    ctx.report_done(JobStage::Chunking, message).await;

    machine
        .chunk()
        .map_err(|(_, guard)| map_guard_error("chunk", &guard))
}

#[instrument(level = "trace", skip_all, fields(job_id = %ctx.job_id))]
pub async fn embed(
    machine: IngestionMachine<(), Chunked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), Embedded>, AppError> {
    ctx.report_start(JobStage::Embedding, "embedding chunks")
        .await;

    let services = ctx.services;
    let tuning = ctx.tuning;
    let reporter = ctx.reporter;
    let total = ctx.chunks.len();
    let step = tuning.embedding_progress_step.max(1);

    let mut embeddings = Vec::with_capacity(total);
    let requests: Vec<_> = ctx
        .chunks
        .iter()
        .map(|chunk| with_retry(tuning, "embed", move || services.embed_chunk(chunk)))
        .collect();
    let mut pending = stream::iter(requests).buffered(tuning.embedding_concurrency.max(1));

    while let Some(result) = pending.next().await {
        embeddings.push(result?);
        let done = embeddings.len();
        if done % step == 0 && done < total {
            reporter
                .report(
                    JobStage::Embedding,
                    interpolate(JobStage::Embedding, done, total),
                    Some(format!("embedded {done}/{total} chunks")),
                )
                .await;
        }
    }
    drop(pending);

    ctx.embeddings = embeddings;
    ctx.report_done(JobStage::Embedding, format!("embedded {total} chunks"))
        .await;

    machine
        .embed()
        .map_err(|(_, guard)| map_guard_error("embed", &guard))
}

#[instrument(level = "trace", skip_all, fields(job_id = %ctx.job_id))]
pub async fn index_vectors(
    machine: IngestionMachine<(), Embedded>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), VectorsIndexed>, AppError> {
    ctx.report_start(JobStage::VectorIndexing, "writing vectors")
        .await;

    let services = ctx.services;
    let embeddings = std::mem::take(&mut ctx.embeddings);
    if embeddings.len() != ctx.chunks.len() {
        return Err(AppError::InternalError(format!(
            "{} embeddings for {} chunks",
            embeddings.len(),
            ctx.chunks.len()
        )));
    }

    for (chunk, embedding) in ctx.chunks.iter().zip(embeddings) {
        ctx.written_vectors.push(chunk.id.clone());
        with_retry(ctx.tuning, "upsert_vector", || {
            services.upsert_vector(chunk, embedding.clone())
        })
        .await?;
    }

    debug!(
        job_id = %ctx.job_id,
        vectors = ctx.written_vectors.len(),
        "vectors written"
    );
    ctx.report_done(
        JobStage::VectorIndexing,
        format!("wrote {} vectors", ctx.chunks.len()),
    )
    .await;

    machine
        .index_vectors()
        .map_err(|(_, guard)| map_guard_error("index_vectors", &guard))
}

#[instrument(level = "trace", skip_all, fields(job_id = %ctx.job_id))]
pub async fn index_keywords(
    machine: IngestionMachine<(), VectorsIndexed>,
    ctx: &mut PipelineContext<'_>,
) -> Result<IngestionMachine<(), KeywordsIndexed>, AppError> {
    ctx.report_start(JobStage::KeywordIndexing, "indexing keywords")
        .await;

    let services = ctx.services;
    ctx.written_keywords
        .extend(ctx.chunks.iter().map(|chunk| chunk.id.clone()));
    let chunks = &ctx.chunks;
    with_retry(ctx.tuning, "index_keywords", || {
        services.index_keywords(chunks.clone())
    })
    .await?;

    ctx.report_done(
        JobStage::KeywordIndexing,
        format!("indexed {} chunks", ctx.chunks.len()),
    )
    .await;

    machine
        .index_keywords()
        .map_err(|(_, guard)| map_guard_error("index_keywords", &guard))
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid ingestion pipeline transition during {event}: {guard:?}"
    ))
}
