use std::time::Duration;

use common::utils::config::AppConfig;

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    /// Total attempts per collaborator call, first try included.
    pub max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub embedding_concurrency: usize,
    pub embedding_progress_step: usize,
    pub job_timeout: Duration,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 2_000,
            embedding_concurrency: 8,
            embedding_progress_step: 16,
            job_timeout: Duration::from_secs(600),
        }
    }
}

impl IngestionTuning {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.ingest_max_attempts.max(1),
            embedding_concurrency: config.embedding_concurrency.max(1),
            embedding_progress_step: config.embedding_progress_step.max(1),
            job_timeout: Duration::from_secs(config.job_timeout_secs.max(1)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorLimits {
    pub max_concurrent_jobs: usize,
    /// Jobs allowed to wait for a slot. Zero rejects every submission at the ceiling.
    pub max_queued_jobs: usize,
    /// Terminal jobs kept for status reads before the oldest are evicted.
    pub max_retained_jobs: usize,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            max_queued_jobs: 32,
            max_retained_jobs: 256,
        }
    }
}

impl OrchestratorLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            max_queued_jobs: config.max_queued_jobs,
            max_retained_jobs: config.max_retained_jobs.max(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    pub limits: OrchestratorLimits,
}

impl IngestionConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tuning: IngestionTuning::from_config(config),
            limits: OrchestratorLimits::from_config(config),
        }
    }
}
