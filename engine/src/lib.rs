#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod telemetry;

use std::{path::Path, sync::Arc};

use common::{
    error::AppError,
    storage::{
        job_store::{FileJobStore, InMemoryJobStore, JobStore},
        types::{
            document::{ContentKind, Document},
            ingestion_job::JobSnapshot,
            progress_event::ProgressEvent,
        },
        vector_store::{InMemoryVectorStore, VectorStore},
    },
    utils::{
        config::AppConfig,
        embedding::{Embedder, EmbeddingProvider},
    },
};
use futures::{stream::BoxStream, Stream};
use ingestion_pipeline::{
    utils::chunking::{Chunker, TextSplitterChunker},
    DefaultPipelineServices, IngestionConfig, IngestionPipeline, JobOrchestrator,
};
use retrieval_pipeline::{
    answer_retrieval::{Answer, AnswerGenerator, ExtractiveAnswerGenerator, QueryEvent, QueryService},
    cache::{CacheStats, QueryCache},
    fts::KeywordIndex,
    reranking::{Reranker, RerankerPool},
    RetrievalEngine, RetrievalResult, RetrievalStrategy, RetrievalTuning,
};
use tracing::info;

/// Wires configuration and collaborators into a ready [`Engine`].
///
/// Anything not supplied explicitly is built from the config's default adapters.
pub struct EngineBuilder {
    config: AppConfig,
    embedder: Option<Arc<dyn Embedder>>,
    vectors: Option<Arc<dyn VectorStore>>,
    reranker: Option<Arc<dyn Reranker>>,
    chunker: Option<Arc<dyn Chunker>>,
    job_store: Option<Arc<dyn JobStore>>,
    generator: Option<Arc<dyn AnswerGenerator>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            embedder: None,
            vectors: None,
            reranker: None,
            chunker: None,
            job_store: None,
            generator: None,
        }
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn with_vector_store(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    #[must_use]
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    #[must_use]
    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    #[must_use]
    pub fn with_job_store(mut self, job_store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(job_store);
        self
    }

    #[must_use]
    pub fn with_answer_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Builds every component and restores persisted jobs.
    pub async fn build(self) -> Result<Engine, AppError> {
        let config = self.config;
        let default_strategy = config.default_strategy.parse::<RetrievalStrategy>()?;
        if config.default_top_k == 0 {
            return Err(AppError::InvalidArgument(
                "default_top_k must be a positive integer".into(),
            ));
        }

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => Arc::new(EmbeddingProvider::from_config(&config).await?),
        };
        let vectors: Arc<dyn VectorStore> = self
            .vectors
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new(embedder.dimension())));
        let reranker: Option<Arc<dyn Reranker>> = match self.reranker {
            Some(reranker) => Some(reranker),
            None => RerankerPool::maybe_from_config(&config)?
                .map(|pool| pool as Arc<dyn Reranker>),
        };
        let chunker: Arc<dyn Chunker> = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::new(TextSplitterChunker::from_config(&config)?),
        };
        let job_store: Arc<dyn JobStore> = match (self.job_store, &config.job_store_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileJobStore::open(dir).await?),
            (None, None) => Arc::new(InMemoryJobStore::new()),
        };
        let generator = self
            .generator
            .unwrap_or_else(|| Arc::new(ExtractiveAnswerGenerator::default()));

        let cache = QueryCache::from_config(&config);
        let cache = cache.is_enabled().then(|| Arc::new(cache));
        let keywords = Arc::new(KeywordIndex::new());

        let mut retrieval = RetrievalEngine::new(
            Arc::clone(&embedder),
            Arc::clone(&vectors),
            Arc::clone(&keywords),
            RetrievalTuning::from_config(&config),
        );
        let reranking = reranker.is_some();
        if let Some(reranker) = reranker {
            retrieval = retrieval.with_reranker(reranker);
        }
        let queries = QueryService::new(Arc::new(retrieval), cache.clone(), generator);

        let ingestion = IngestionConfig::from_config(&config);
        let services = DefaultPipelineServices::new(chunker, embedder, vectors, keywords);
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(services),
            ingestion.tuning,
        ));
        let orchestrator = JobOrchestrator::new(pipeline, job_store, ingestion.limits, cache);
        let restored = orchestrator.restore().await?;

        info!(
            default_strategy = %default_strategy,
            default_top_k = config.default_top_k,
            reranking,
            restored,
            "Engine ready"
        );

        Ok(Engine {
            orchestrator,
            queries,
            default_strategy,
            default_top_k: config.default_top_k,
        })
    }
}

/// Ingestion jobs and hybrid queries behind one handle.
pub struct Engine {
    orchestrator: JobOrchestrator,
    queries: QueryService,
    default_strategy: RetrievalStrategy,
    default_top_k: usize,
}

impl Engine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub async fn from_config(config: AppConfig) -> Result<Self, AppError> {
        EngineBuilder::new(config).build().await
    }

    pub fn default_strategy(&self) -> RetrievalStrategy {
        self.default_strategy
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Admits the document and returns its job id, or `CapacityExceeded` when the queue is full.
    pub async fn submit_ingest_job(&self, document: Document) -> Result<String, AppError> {
        self.orchestrator.submit(document).await
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<JobSnapshot, AppError> {
        self.orchestrator.get_status(job_id).await
    }

    /// Replays the job's events so far, then follows it until the terminal event.
    pub async fn subscribe_job_events(
        &self,
        job_id: &str,
    ) -> Result<BoxStream<'static, ProgressEvent>, AppError> {
        self.orchestrator.subscribe(job_id).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<JobSnapshot, AppError> {
        self.orchestrator.cancel(job_id).await
    }

    pub async fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.orchestrator.list_jobs().await
    }

    pub async fn query(
        &self,
        question: &str,
        strategy: RetrievalStrategy,
        top_k: usize,
    ) -> Result<RetrievalResult, AppError> {
        self.queries.query(question, strategy, top_k).await
    }

    /// Like [`Engine::query`], with the strategy given by name.
    pub async fn query_named(
        &self,
        question: &str,
        strategy: &str,
        top_k: usize,
    ) -> Result<RetrievalResult, AppError> {
        let strategy = strategy.parse::<RetrievalStrategy>()?;
        self.query(question, strategy, top_k).await
    }

    pub async fn answer(
        &self,
        question: &str,
        strategy: RetrievalStrategy,
        top_k: usize,
    ) -> Result<Answer, AppError> {
        self.queries.answer(question, strategy, top_k).await
    }

    pub fn answer_stream<'a>(
        &'a self,
        question: &'a str,
        strategy: RetrievalStrategy,
        top_k: usize,
    ) -> impl Stream<Item = QueryEvent> + Send + 'a {
        self.queries.answer_stream(question, strategy, top_k)
    }

    /// `None` when caching is disabled.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.queries.cache_stats()
    }
}

/// Reads a file into a document. The kind comes from `kind` or else the file extension.
pub async fn document_from_path(
    path: &Path,
    kind: Option<ContentKind>,
) -> Result<Document, AppError> {
    let content = tokio::fs::read_to_string(path).await?;
    let kind = kind.unwrap_or_else(|| {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(ContentKind::PlainText, ContentKind::from_extension)
    });
    let mut document = Document::new(kind, content).with_source(path.display().to_string());
    if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
        document = document.with_title(name);
    }
    Ok(document)
}
