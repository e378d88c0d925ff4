use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use super::embedding::EmbeddingBackend;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_max_queued_jobs")]
    pub max_queued_jobs: usize,
    #[serde(default = "default_max_retained_jobs")]
    pub max_retained_jobs: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_ingest_max_attempts")]
    pub ingest_max_attempts: usize,
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    #[serde(default = "default_embedding_progress_step")]
    pub embedding_progress_step: usize,
    #[serde(default)]
    pub job_store_dir: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_chunk_overlap_chars")]
    pub chunk_overlap_chars: usize,

    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
    #[serde(default)]
    pub fastembed_model: Option<String>,

    #[serde(default)]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,

    #[serde(default = "default_fusion_weight")]
    pub dense_weight: f32,
    #[serde(default = "default_fusion_weight")]
    pub keyword_weight: f32,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_rerank_headroom")]
    pub rerank_headroom: usize,
    #[serde(default = "default_strategy_timeout_ms")]
    pub strategy_timeout_ms: u64,
    #[serde(default = "default_rerank_timeout_ms")]
    pub rerank_timeout_ms: u64,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_max_queued_jobs() -> usize {
    32
}

fn default_max_retained_jobs() -> usize {
    256
}

fn default_job_timeout_secs() -> u64 {
    600
}

fn default_ingest_max_attempts() -> usize {
    3
}

fn default_embedding_concurrency() -> usize {
    8
}

fn default_embedding_progress_step() -> usize {
    16
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_chunk_max_chars() -> usize {
    800
}

fn default_chunk_overlap_chars() -> usize {
    200
}

fn default_embedding_dimensions() -> usize {
    384
}

fn default_fusion_weight() -> f32 {
    0.5
}

fn default_candidate_multiplier() -> usize {
    3
}

fn default_rerank_headroom() -> usize {
    3
}

fn default_strategy_timeout_ms() -> u64 {
    5_000
}

fn default_rerank_timeout_ms() -> u64 {
    10_000
}

fn default_cache_capacity() -> usize {
    1_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_top_k() -> usize {
    5
}

fn default_strategy() -> String {
    "hybrid".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queued_jobs: default_max_queued_jobs(),
            max_retained_jobs: default_max_retained_jobs(),
            job_timeout_secs: default_job_timeout_secs(),
            ingest_max_attempts: default_ingest_max_attempts(),
            embedding_concurrency: default_embedding_concurrency(),
            embedding_progress_step: default_embedding_progress_step(),
            job_store_dir: None,
            data_dir: default_data_dir(),
            chunk_max_chars: default_chunk_max_chars(),
            chunk_overlap_chars: default_chunk_overlap_chars(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_dimensions: default_embedding_dimensions(),
            fastembed_model: None,
            reranking_enabled: false,
            reranking_pool_size: None,
            fastembed_cache_dir: None,
            fastembed_show_download_progress: None,
            fastembed_max_length: None,
            dense_weight: default_fusion_weight(),
            keyword_weight: default_fusion_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            rerank_headroom: default_rerank_headroom(),
            strategy_timeout_ms: default_strategy_timeout_ms(),
            rerank_timeout_ms: default_rerank_timeout_ms(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            default_top_k: default_top_k(),
            default_strategy: default_strategy(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
