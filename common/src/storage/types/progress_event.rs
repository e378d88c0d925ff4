use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ingestion_job::JobStatus;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    #[default]
    Queued,
    Started,
    Chunking,
    Embedding,
    VectorIndexing,
    KeywordIndexing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Queued => "queued",
            JobStage::Started => "started",
            JobStage::Chunking => "chunking",
            JobStage::Embedding => "embedding",
            JobStage::VectorIndexing => "vector_indexing",
            JobStage::KeywordIndexing => "keyword_indexing",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Completed | JobStage::Failed | JobStage::Cancelled
        )
    }

    /// Progress reported when the stage begins and, for pipeline stages, when it ends.
    pub fn progress_bounds(&self) -> (u8, Option<u8>) {
        match self {
            JobStage::Queued => (0, None),
            JobStage::Started => (5, None),
            JobStage::Chunking => (10, Some(25)),
            JobStage::Embedding => (30, Some(55)),
            JobStage::VectorIndexing => (60, Some(80)),
            JobStage::KeywordIndexing => (85, Some(95)),
            JobStage::Completed => (100, None),
            JobStage::Failed | JobStage::Cancelled => (0, None),
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub chunk_count: usize,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn success(chunk_count: usize) -> Self {
        Self {
            status: JobStatus::Success,
            chunk_count,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            chunk_count: 0,
            error: Some(reason.into()),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Cancelled,
            chunk_count: 0,
            error: Some(reason.into()),
        }
    }
}

/// One entry of a job's append-only progress log.
///
/// `outcome` is set on the terminal event only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub sequence: u64,
    pub stage: JobStage,
    pub progress: u8,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub outcome: Option<JobOutcome>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}
