use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use common::{
    storage::types::{document::ContentKind, ingestion_job::JobStatus},
    utils::config::get_config,
};
use engine::{document_from_path, telemetry::init_tracing, Engine};
use futures::StreamExt;
use retrieval_pipeline::{answer_retrieval::AnswerReference, RetrievalStrategy};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "engine",
    about = "Ingest documents and ask questions with dense, keyword or hybrid retrieval"
)]
struct Cli {
    /// Files to ingest before answering questions
    files: Vec<PathBuf>,

    /// Content kind for every file (text, html, markdown, binary_text); inferred from the extension when omitted
    #[arg(long)]
    kind: Option<ContentKind>,

    /// Question to answer once ingestion finished; may be repeated
    #[arg(long = "question", short = 'q')]
    questions: Vec<String>,

    /// Retrieval strategy; defaults to the configured one
    #[arg(long, value_enum)]
    strategy: Option<RetrievalStrategy>,

    /// Number of passages to retrieve; defaults to the configured one
    #[arg(long)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct AnswerLine<'a> {
    question: &'a str,
    strategy: RetrievalStrategy,
    answer: &'a str,
    degraded: bool,
    references: &'a [AnswerReference],
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = get_config().context("loading configuration")?;
    let engine = Engine::from_config(config)
        .await
        .context("building engine")?;

    let mut failed_jobs = 0usize;
    for path in &cli.files {
        let document = document_from_path(path, cli.kind)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let job_id = engine.submit_ingest_job(document).await?;
        info!(job_id = %job_id, path = %path.display(), "Submitted ingestion job");

        let mut events = engine.subscribe_job_events(&job_id).await?;
        while let Some(event) = events.next().await {
            print_json(&event)?;
        }

        let snapshot = engine.get_job_status(&job_id).await?;
        if snapshot.status != JobStatus::Success {
            failed_jobs = failed_jobs.saturating_add(1);
            warn!(job_id = %job_id, status = %snapshot.status, "Ingestion did not succeed");
        }
    }

    let strategy = cli.strategy.unwrap_or_else(|| engine.default_strategy());
    let top_k = cli.top_k.unwrap_or_else(|| engine.default_top_k());
    for question in &cli.questions {
        let answer = engine.answer(question, strategy, top_k).await?;
        print_json(&AnswerLine {
            question,
            strategy,
            answer: &answer.content,
            degraded: answer.retrieval.is_degraded(),
            references: &answer.references,
        })?;
    }

    if let Some(stats) = engine.cache_stats() {
        info!(
            hits = stats.hits,
            misses = stats.misses,
            entries = stats.entries,
            "Query cache statistics"
        );
    }

    if failed_jobs > 0 {
        anyhow::bail!("{failed_jobs} ingestion job(s) did not succeed");
    }
    Ok(())
}
