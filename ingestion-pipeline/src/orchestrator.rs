use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        job_store::JobStore,
        types::{
            document::Document,
            ingestion_job::{JobSnapshot, JobStatus, JobTransition},
            progress_event::{JobOutcome, JobStage, ProgressEvent},
        },
    },
};
use futures::stream::BoxStream;
use retrieval_pipeline::cache::QueryCache;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    pipeline::{IngestionPipeline, OrchestratorLimits, ProgressReporter},
    progress::ProgressStreamer,
};

pub const INTERRUPTED_REASON: &str = "interrupted before completion";

struct StartedJob {
    job_id: String,
    document: Document,
    cancel: CancellationToken,
}

struct JobEntry {
    snapshot: JobSnapshot,
    streamer: ProgressStreamer,
    cancel: CancellationToken,
    /// Held until a worker picks the job up.
    document: Option<Document>,
    revision: u64,
    /// Last revision written to the job store.
    persisted: Arc<Mutex<u64>>,
}

impl JobEntry {
    fn admitted(job_id: &str, document: Document) -> Self {
        let snapshot = JobSnapshot {
            id: job_id.to_string(),
            document_id: document.id.clone(),
            document_kind: document.kind,
            document_title: document.title.clone(),
            status: JobStatus::Queued,
            stage: JobStage::Queued,
            progress: 0,
            events: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outcome: None,
        };
        Self {
            snapshot,
            streamer: ProgressStreamer::new(job_id),
            cancel: CancellationToken::new(),
            document: Some(document),
            revision: 1,
            persisted: Arc::new(Mutex::new(0)),
        }
    }

    fn restored(mut snapshot: JobSnapshot) -> Self {
        let events = std::mem::take(&mut snapshot.events);
        Self {
            streamer: ProgressStreamer::from_history(&snapshot.id, events),
            snapshot,
            cancel: CancellationToken::new(),
            document: None,
            revision: 0,
            persisted: Arc::new(Mutex::new(0)),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        let mut snapshot = self.snapshot.clone();
        snapshot.events = self.streamer.history();
        snapshot
    }

    fn record(
        &mut self,
        stage: JobStage,
        progress: u8,
        message: Option<String>,
        outcome: Option<JobOutcome>,
    ) -> Result<ProgressEvent, AppError> {
        let event = self.streamer.append(stage, progress, message, outcome)?;
        self.snapshot.stage = event.stage;
        self.snapshot.progress = event.progress;
        self.revision = self.revision.saturating_add(1);
        Ok(event)
    }

    fn start(&mut self) -> Result<StartedJob, AppError> {
        self.snapshot.status = self.snapshot.status.transition(JobTransition::Start)?;
        let document = self.document.take().ok_or_else(|| {
            AppError::InternalError(format!("job {} has no document to process", self.snapshot.id))
        })?;
        self.snapshot.started_at = Some(Utc::now());
        let (progress, _) = JobStage::Started.progress_bounds();
        self.record(JobStage::Started, progress, Some("job started".into()), None)?;
        Ok(StartedJob {
            job_id: self.snapshot.id.clone(),
            document,
            cancel: self.cancel.clone(),
        })
    }

    fn finish(
        &mut self,
        transition: JobTransition,
        stage: JobStage,
        outcome: JobOutcome,
    ) -> Result<(), AppError> {
        self.snapshot.status = self.snapshot.status.transition(transition)?;
        self.document = None;
        let (progress, _) = stage.progress_bounds();
        let message = outcome
            .error
            .clone()
            .unwrap_or_else(|| format!("indexed {} chunks", outcome.chunk_count));
        self.record(stage, progress, Some(message), Some(outcome.clone()))?;
        self.snapshot.outcome = Some(outcome);
        self.snapshot.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobEntry>,
    queue: VecDeque<String>,
    running: usize,
}

impl JobTable {
    /// Starts the oldest job still waiting, skipping ids cancelled while queued.
    fn start_next_queued(&mut self) -> Option<StartedJob> {
        while let Some(job_id) = self.queue.pop_front() {
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if entry.snapshot.status != JobStatus::Queued {
                continue;
            }
            match entry.start() {
                Ok(job) => return Some(job),
                Err(err) => error!(job_id = %job_id, error = %err, "failed to start queued job"),
            }
        }
        None
    }

    /// Drops the oldest terminal jobs beyond `limit`, returning their ids.
    fn evict_retained(&mut self, limit: usize) -> Vec<String> {
        let mut terminal: Vec<(chrono::DateTime<Utc>, String)> = self
            .jobs
            .values()
            .filter(|entry| entry.snapshot.status.is_terminal())
            .map(|entry| {
                (
                    entry
                        .snapshot
                        .completed_at
                        .unwrap_or(entry.snapshot.created_at),
                    entry.snapshot.id.clone(),
                )
            })
            .collect();
        if terminal.len() <= limit {
            return Vec::new();
        }
        terminal.sort();
        let excess = terminal.len().saturating_sub(limit);
        terminal
            .into_iter()
            .take(excess)
            .map(|(_, job_id)| {
                self.jobs.remove(&job_id);
                job_id
            })
            .collect()
    }
}

struct Inner {
    pipeline: Arc<IngestionPipeline>,
    store: Arc<dyn JobStore>,
    cache: Option<Arc<QueryCache>>,
    limits: OrchestratorLimits,
    table: Mutex<JobTable>,
}

impl Inner {
    /// Writes the job's current snapshot unless a newer one was already stored.
    async fn persist(&self, job_id: &str) {
        let gate = {
            let table = self.table.lock().await;
            match table.jobs.get(job_id) {
                Some(entry) => Arc::clone(&entry.persisted),
                None => return,
            }
        };
        let mut persisted = gate.lock().await;
        let current = {
            let table = self.table.lock().await;
            table
                .jobs
                .get(job_id)
                .map(|entry| (entry.revision, entry.snapshot()))
        };
        let Some((revision, snapshot)) = current else {
            return;
        };
        if revision <= *persisted {
            return;
        }
        match self.store.save(&snapshot).await {
            Ok(()) => *persisted = revision,
            Err(err) => warn!(job_id = %job_id, error = %err, "failed to persist job snapshot"),
        }
    }

    async fn forget(&self, job_ids: Vec<String>) {
        for job_id in job_ids {
            if let Err(err) = self.store.remove(&job_id).await {
                warn!(job_id = %job_id, error = %err, "failed to remove evicted job");
            }
        }
    }

    async fn run(self: &Arc<Self>, job: StartedJob) -> Result<usize, AppError> {
        let reporter = JobReporter {
            inner: Arc::clone(self),
            job_id: job.job_id.clone(),
        };
        let pipeline = Arc::clone(&self.pipeline);
        let handle = tokio::spawn(async move {
            pipeline
                .process(&job.job_id, &job.document, &reporter, &job.cancel)
                .await
        });
        handle.await.unwrap_or_else(|err| Err(AppError::from(err)))
    }

    /// Records the outcome and hands the slot to the next queued job, if any.
    async fn complete(&self, job_id: &str, result: Result<usize, AppError>) -> Option<StartedJob> {
        // Cleared before the outcome is visible, so no reader sees success with stale answers.
        if result.is_ok() {
            if let Some(cache) = &self.cache {
                cache.clear();
            }
        }

        let mut table = self.table.lock().await;
        if let Some(entry) = table.jobs.get_mut(job_id) {
            let recorded = match &result {
                Ok(chunk_count) => entry.finish(
                    JobTransition::Succeed,
                    JobStage::Completed,
                    JobOutcome::success(*chunk_count),
                ),
                Err(err @ AppError::Cancelled(_)) => entry.finish(
                    JobTransition::Cancel,
                    JobStage::Cancelled,
                    JobOutcome::cancelled(err.to_string()),
                ),
                Err(err) => entry.finish(
                    JobTransition::Fail,
                    JobStage::Failed,
                    JobOutcome::failed(err.to_string()),
                ),
            };
            if let Err(err) = recorded {
                error!(job_id = %job_id, error = %err, "failed to record job outcome");
            }
        }

        let next = table.start_next_queued();
        if next.is_none() {
            table.running = table.running.saturating_sub(1);
        }
        let evicted = table.evict_retained(self.limits.max_retained_jobs);
        let running = table.running;
        let queued = table.queue.len();
        drop(table);

        match &result {
            Ok(chunk_count) => {
                info!(job_id = %job_id, chunk_count, running, queued, "ingestion job succeeded");
            }
            Err(AppError::Cancelled(_)) => {
                info!(job_id = %job_id, running, queued, "ingestion job cancelled");
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, running, queued, "ingestion job failed");
            }
        }

        self.persist(job_id).await;
        self.forget(evicted).await;
        next
    }
}

/// Feeds pipeline progress into the job's log.
struct JobReporter {
    inner: Arc<Inner>,
    job_id: String,
}

#[async_trait]
impl ProgressReporter for JobReporter {
    async fn report(&self, stage: JobStage, progress: u8, message: Option<String>) {
        let mut table = self.inner.table.lock().await;
        if let Some(entry) = table.jobs.get_mut(&self.job_id) {
            if let Err(err) = entry.record(stage, progress, message, None) {
                warn!(job_id = %self.job_id, error = %err, "dropping progress event");
            }
        }
    }
}

fn spawn_worker(inner: Arc<Inner>, job: StartedJob) {
    tokio::spawn(async move {
        let mut next = Some(job);
        while let Some(job) = next {
            let job_id = job.job_id.clone();
            inner.persist(&job_id).await;
            let result = inner.run(job).await;
            next = inner.complete(&job_id, result).await;
        }
    });
}

/// Admits ingestion jobs, bounds how many run at once and tracks their lifecycle.
///
/// Jobs beyond the concurrency ceiling wait in a FIFO queue of bounded length; submissions
/// beyond that are rejected with `CapacityExceeded`.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        store: Arc<dyn JobStore>,
        limits: OrchestratorLimits,
        cache: Option<Arc<QueryCache>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                store,
                cache,
                limits,
                table: Mutex::new(JobTable::default()),
            }),
        }
    }

    pub fn limits(&self) -> &OrchestratorLimits {
        &self.inner.limits
    }

    #[instrument(skip_all, fields(document_id = %document.id, kind = %document.kind))]
    pub async fn submit(&self, document: Document) -> Result<String, AppError> {
        let limits = &self.inner.limits;
        let job_id = Uuid::new_v4().to_string();

        let mut table = self.inner.table.lock().await;
        let start_now = table.running < limits.max_concurrent_jobs;
        if !start_now && table.queue.len() >= limits.max_queued_jobs {
            let running = table.running;
            let queued = table.queue.len();
            drop(table);
            warn!(running, queued, "rejecting ingestion job at capacity");
            return Err(AppError::CapacityExceeded(format!(
                "{running} jobs running and {queued} queued"
            )));
        }

        let mut entry = JobEntry::admitted(&job_id, document);
        entry.record(JobStage::Queued, 0, Some("job admitted".into()), None)?;
        let started = if start_now {
            let job = entry.start()?;
            table.running = table.running.saturating_add(1);
            Some(job)
        } else {
            table.queue.push_back(job_id.clone());
            None
        };
        table.jobs.insert(job_id.clone(), entry);
        let running = table.running;
        let queued = table.queue.len();
        drop(table);

        info!(
            job_id = %job_id,
            started = started.is_some(),
            running,
            queued,
            "ingestion job admitted"
        );
        self.inner.persist(&job_id).await;
        if let Some(job) = started {
            spawn_worker(Arc::clone(&self.inner), job);
        }
        Ok(job_id)
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobSnapshot, AppError> {
        let table = self.inner.table.lock().await;
        table
            .jobs
            .get(job_id)
            .map(JobEntry::snapshot)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    pub async fn subscribe(
        &self,
        job_id: &str,
    ) -> Result<BoxStream<'static, ProgressEvent>, AppError> {
        let streamer = {
            let table = self.inner.table.lock().await;
            table
                .jobs
                .get(job_id)
                .map(|entry| entry.streamer.clone())
                .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?
        };
        Ok(streamer.subscribe())
    }

    /// Queued jobs are cancelled on the spot. Running jobs are signalled and settle as
    /// `cancelled` once the current stage yields and the partial writes are rolled back.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: &str) -> Result<JobSnapshot, AppError> {
        let mut table = self.inner.table.lock().await;
        let entry = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;

        match entry.snapshot.status {
            JobStatus::Queued => {
                let reason = AppError::Cancelled("cancelled before start".into()).to_string();
                entry.finish(
                    JobTransition::Cancel,
                    JobStage::Cancelled,
                    JobOutcome::cancelled(reason),
                )?;
                let snapshot = entry.snapshot();
                table.queue.retain(|queued| queued != job_id);
                let evicted = table.evict_retained(self.inner.limits.max_retained_jobs);
                drop(table);

                info!(job_id = %job_id, "queued ingestion job cancelled");
                self.inner.persist(job_id).await;
                self.inner.forget(evicted).await;
                Ok(snapshot)
            }
            JobStatus::Running => {
                entry.cancel.cancel();
                info!(job_id = %job_id, "cancellation requested for running job");
                Ok(entry.snapshot())
            }
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled => Ok(entry.snapshot()),
        }
    }

    /// Retained jobs, newest first.
    pub async fn list_jobs(&self) -> Vec<JobSnapshot> {
        let table = self.inner.table.lock().await;
        let mut jobs: Vec<JobSnapshot> = table.jobs.values().map(JobEntry::snapshot).collect();
        drop(table);
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub async fn running_jobs(&self) -> usize {
        self.inner.table.lock().await.running
    }

    pub async fn queued_jobs(&self) -> usize {
        self.inner.table.lock().await.queue.len()
    }

    /// Reloads persisted jobs. Jobs that never reached a terminal state are marked failed.
    #[instrument(skip_all)]
    pub async fn restore(&self) -> Result<usize, AppError> {
        let snapshots = self.inner.store.load_all().await?;

        let mut table = self.inner.table.lock().await;
        let mut restored = Vec::with_capacity(snapshots.len());
        let mut interrupted = 0usize;
        for snapshot in snapshots {
            if table.jobs.contains_key(&snapshot.id) {
                continue;
            }
            let mut entry = JobEntry::restored(snapshot);
            if !entry.snapshot.status.is_terminal() {
                entry.finish(
                    JobTransition::Fail,
                    JobStage::Failed,
                    JobOutcome::failed(INTERRUPTED_REASON),
                )?;
                interrupted = interrupted.saturating_add(1);
            }
            restored.push(entry.snapshot.id.clone());
            table.jobs.insert(entry.snapshot.id.clone(), entry);
        }
        let evicted = table.evict_retained(self.inner.limits.max_retained_jobs);
        drop(table);

        info!(restored = restored.len(), interrupted, "restored persisted jobs");
        for job_id in &restored {
            self.inner.persist(job_id).await;
        }
        self.inner.forget(evicted).await;
        Ok(restored.len())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use common::{
        storage::{
            job_store::InMemoryJobStore,
            types::{document::ContentKind, text_chunk::TextChunk},
            vector_store::{InMemoryVectorStore, VectorStore},
        },
        utils::embedding::EmbeddingProvider,
    };
    use futures::StreamExt;
    use retrieval_pipeline::{fts::KeywordIndex, RetrievalResult, RetrievalStrategy};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        pipeline::{DefaultPipelineServices, IngestionTuning},
        utils::chunking::{Chunker, TextSplitterChunker},
    };

    /// Blocks every chunk call until the gate is opened.
    struct GatedChunker {
        inner: TextSplitterChunker,
        gate: Semaphore,
        entered: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl GatedChunker {
        fn new(open: bool) -> Self {
            Self {
                inner: TextSplitterChunker::new(200, 20).unwrap(),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
                entered: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn open(&self) {
            self.gate.add_permits(1_000);
        }
    }

    #[async_trait]
    impl Chunker for GatedChunker {
        async fn chunk(&self, document: &Document) -> Result<Vec<TextChunk>, AppError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let permit = self.gate.acquire().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            self.inner.chunk(document).await
        }
    }

    struct Harness {
        orchestrator: JobOrchestrator,
        chunker: Arc<GatedChunker>,
        vectors: Arc<InMemoryVectorStore>,
        store: Arc<InMemoryJobStore>,
        cache: Arc<QueryCache>,
    }

    fn harness(limits: OrchestratorLimits, open: bool) -> Harness {
        harness_with_store(limits, open, Arc::new(InMemoryJobStore::new()))
    }

    fn harness_with_store(
        limits: OrchestratorLimits,
        open: bool,
        store: Arc<InMemoryJobStore>,
    ) -> Harness {
        let chunker = Arc::new(GatedChunker::new(open));
        let vectors = Arc::new(InMemoryVectorStore::new(32));
        let services = DefaultPipelineServices::new(
            Arc::clone(&chunker) as Arc<dyn Chunker>,
            Arc::new(EmbeddingProvider::new_hashed(32)),
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            Arc::new(KeywordIndex::new()),
        );
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(services),
            IngestionTuning::default(),
        ));
        let cache = Arc::new(QueryCache::new(8, Duration::from_secs(60)));
        let orchestrator = JobOrchestrator::new(
            pipeline,
            Arc::clone(&store) as Arc<dyn JobStore>,
            limits,
            Some(Arc::clone(&cache)),
        );
        Harness {
            orchestrator,
            chunker,
            vectors,
            store,
            cache,
        }
    }

    fn limits(concurrent: usize, queued: usize, retained: usize) -> OrchestratorLimits {
        OrchestratorLimits {
            max_concurrent_jobs: concurrent,
            max_queued_jobs: queued,
            max_retained_jobs: retained,
        }
    }

    fn document(text: &str) -> Document {
        Document::new(ContentKind::PlainText, text)
    }

    async fn wait_terminal(orchestrator: &JobOrchestrator, job_id: &str) -> JobSnapshot {
        let events: Vec<ProgressEvent> = orchestrator
            .subscribe(job_id)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(events.last().is_some_and(ProgressEvent::is_terminal));
        orchestrator.get_status(job_id).await.unwrap()
    }

    async fn wait_until_entered(chunker: &GatedChunker, count: usize) {
        while chunker.entered.load(Ordering::SeqCst) < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn wait_for_store<F>(store: &InMemoryJobStore, done: F) -> Vec<JobSnapshot>
    where
        F: Fn(&[JobSnapshot]) -> bool,
    {
        for _ in 0..500 {
            let stored = store.load_all().await.unwrap();
            if done(&stored) {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("job store never reached the expected state");
    }

    #[tokio::test]
    async fn runs_a_job_to_success_with_ordered_progress() {
        let h = harness(limits(2, 4, 16), true);
        let job_id = h
            .orchestrator
            .submit(document("Tokio schedules tasks cooperatively."))
            .await
            .unwrap();

        let snapshot = wait_terminal(&h.orchestrator, &job_id).await;
        assert_eq!(snapshot.status, JobStatus::Success);
        assert_eq!(snapshot.chunk_count(), Some(1));
        assert_eq!(snapshot.progress, 100);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.completed_at.is_some());

        let stages: Vec<JobStage> = snapshot.events.iter().map(|e| e.stage).collect();
        assert_eq!(stages.first(), Some(&JobStage::Queued));
        assert_eq!(stages.last(), Some(&JobStage::Completed));
        assert!(stages.contains(&JobStage::KeywordIndexing));
        assert!(snapshot
            .events
            .windows(2)
            .all(|pair| pair[0].progress <= pair[1].progress));
        assert_eq!(
            snapshot.events.iter().filter(|e| e.is_terminal()).count(),
            1
        );
        assert_eq!(h.vectors.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn never_runs_more_than_the_ceiling() {
        let h = harness(limits(2, 1, 16), false);
        let first = h.orchestrator.submit(document("one")).await.unwrap();
        let second = h.orchestrator.submit(document("two")).await.unwrap();
        let third = h.orchestrator.submit(document("three")).await.unwrap();
        let rejected = h.orchestrator.submit(document("four")).await;

        assert!(matches!(rejected, Err(AppError::CapacityExceeded(_))));
        wait_until_entered(&h.chunker, 2).await;
        assert_eq!(h.orchestrator.running_jobs().await, 2);
        assert_eq!(
            h.orchestrator.get_status(&third).await.unwrap().status,
            JobStatus::Queued
        );

        h.chunker.open();
        for job_id in [&first, &second, &third] {
            let snapshot = wait_terminal(&h.orchestrator, job_id).await;
            assert_eq!(snapshot.status, JobStatus::Success);
        }
        assert!(h.chunker.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(h.orchestrator.running_jobs().await, 0);
        assert_eq!(h.orchestrator.queued_jobs().await, 0);
    }

    #[tokio::test]
    async fn zero_queue_rejects_at_the_ceiling() {
        let h = harness(limits(1, 0, 16), false);
        h.orchestrator.submit(document("one")).await.unwrap();
        assert!(matches!(
            h.orchestrator.submit(document("two")).await,
            Err(AppError::CapacityExceeded(_))
        ));
        h.chunker.open();
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_never_runs_it() {
        let h = harness(limits(1, 4, 16), false);
        let running = h.orchestrator.submit(document("first")).await.unwrap();
        let queued = h.orchestrator.submit(document("second")).await.unwrap();
        wait_until_entered(&h.chunker, 1).await;

        let snapshot = h.orchestrator.cancel(&queued).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert!(snapshot.started_at.is_none());
        let stages: Vec<JobStage> = snapshot.events.iter().map(|e| e.stage).collect();
        assert_eq!(stages, vec![JobStage::Queued, JobStage::Cancelled]);

        h.chunker.open();
        assert_eq!(
            wait_terminal(&h.orchestrator, &running).await.status,
            JobStatus::Success
        );
        assert_eq!(h.chunker.entered.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.orchestrator.get_status(&queued).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn cancelling_a_running_job_settles_as_cancelled() {
        let h = harness(limits(1, 4, 16), false);
        let job_id = h.orchestrator.submit(document("blocked")).await.unwrap();
        wait_until_entered(&h.chunker, 1).await;

        let requested = h.orchestrator.cancel(&job_id).await.unwrap();
        assert_eq!(requested.status, JobStatus::Running);

        let snapshot = wait_terminal(&h.orchestrator, &job_id).await;
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert!(snapshot
            .outcome
            .and_then(|o| o.error)
            .is_some_and(|reason| reason.contains("cancelled")));
        assert_eq!(h.vectors.count().await.unwrap(), 0);

        // The slot is free again.
        h.chunker.open();
        let next = h.orchestrator.submit(document("after")).await.unwrap();
        assert_eq!(
            wait_terminal(&h.orchestrator, &next).await.status,
            JobStatus::Success
        );
    }

    #[tokio::test]
    async fn cancelling_a_terminal_job_is_a_no_op() {
        let h = harness(limits(1, 4, 16), true);
        let job_id = h.orchestrator.submit(document("done")).await.unwrap();
        let finished = wait_terminal(&h.orchestrator, &job_id).await;

        let again = h.orchestrator.cancel(&job_id).await.unwrap();
        assert_eq!(again, finished);
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let h = harness(limits(1, 1, 4), true);
        assert!(matches!(
            h.orchestrator.get_status("missing").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.subscribe("missing").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.cancel("missing").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn successful_ingestion_clears_the_query_cache() {
        let h = harness(limits(1, 1, 4), true);
        h.cache.put(
            retrieval_pipeline::cache::CacheKey::new("rust", RetrievalStrategy::Dense, 3),
            RetrievalResult::empty(RetrievalStrategy::Dense),
        );
        assert_eq!(h.cache.len(), 1);

        let job_id = h.orchestrator.submit(document("fresh content")).await.unwrap();
        wait_terminal(&h.orchestrator, &job_id).await;
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn oldest_terminal_jobs_are_evicted() {
        let h = harness(limits(1, 4, 1), true);
        let first = h.orchestrator.submit(document("first")).await.unwrap();
        wait_terminal(&h.orchestrator, &first).await;
        let second = h.orchestrator.submit(document("second")).await.unwrap();
        wait_terminal(&h.orchestrator, &second).await;

        assert!(matches!(
            h.orchestrator.get_status(&first).await,
            Err(AppError::NotFound(_))
        ));
        assert!(h.orchestrator.get_status(&second).await.is_ok());
        let stored = wait_for_store(&h.store, |stored| {
            stored.len() == 1 && stored.iter().all(JobSnapshot::is_terminal)
        })
        .await;
        assert_eq!(stored[0].id, second);
    }

    #[tokio::test]
    async fn list_jobs_returns_newest_first() {
        let h = harness(limits(2, 4, 16), true);
        let first = h.orchestrator.submit(document("a")).await.unwrap();
        wait_terminal(&h.orchestrator, &first).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = h.orchestrator.submit(document("b")).await.unwrap();
        wait_terminal(&h.orchestrator, &second).await;

        let ids: Vec<String> = h
            .orchestrator
            .list_jobs()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[tokio::test]
    async fn terminal_snapshots_are_persisted() {
        let h = harness(limits(1, 1, 4), true);
        let job_id = h.orchestrator.submit(document("persist me")).await.unwrap();
        let finished = wait_terminal(&h.orchestrator, &job_id).await;

        let stored = wait_for_store(&h.store, |stored| {
            stored.iter().all(JobSnapshot::is_terminal)
        })
        .await;
        assert_eq!(stored, vec![finished]);
    }

    #[tokio::test]
    async fn restore_marks_interrupted_jobs_failed() {
        let store = Arc::new(InMemoryJobStore::new());
        let previous = harness_with_store(limits(1, 4, 16), false, Arc::clone(&store));
        let running = previous.orchestrator.submit(document("one")).await.unwrap();
        let queued = previous.orchestrator.submit(document("two")).await.unwrap();
        wait_until_entered(&previous.chunker, 1).await;
        drop(previous);

        let h = harness_with_store(limits(1, 4, 16), true, Arc::clone(&store));
        assert_eq!(h.orchestrator.restore().await.unwrap(), 2);

        for job_id in [&running, &queued] {
            let snapshot = h.orchestrator.get_status(job_id).await.unwrap();
            assert_eq!(snapshot.status, JobStatus::Failed);
            assert_eq!(
                snapshot.outcome.and_then(|o| o.error).as_deref(),
                Some(INTERRUPTED_REASON)
            );
            let events: Vec<ProgressEvent> = h
                .orchestrator
                .subscribe(job_id)
                .await
                .unwrap()
                .collect()
                .await;
            assert!(events.last().is_some_and(ProgressEvent::is_terminal));
        }

        let stored = store.load_all().await.unwrap();
        assert!(stored.iter().all(|s| s.status == JobStatus::Failed));
    }
}
