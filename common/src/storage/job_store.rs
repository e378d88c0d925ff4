use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::{error::AppError, storage::types::ingestion_job::JobSnapshot};

/// Persistence adapter for job snapshots, so job outcomes survive a restart.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, snapshot: &JobSnapshot) -> Result<(), AppError>;
    async fn load_all(&self) -> Result<Vec<JobSnapshot>, AppError>;
    async fn remove(&self, job_id: &str) -> Result<(), AppError>;
}

/// Keeps serialized snapshots in memory. Useful for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, String>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, snapshot: &JobSnapshot) -> Result<(), AppError> {
        let encoded = serde_json::to_string(snapshot)?;
        self.jobs.write().await.insert(snapshot.id.clone(), encoded);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<JobSnapshot>, AppError> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .map(|encoded| serde_json::from_str(encoded).map_err(AppError::from))
            .collect()
    }

    async fn remove(&self, job_id: &str) -> Result<(), AppError> {
        self.jobs.write().await.remove(job_id);
        Ok(())
    }
}

/// One JSON file per job inside `dir`.
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    fn is_snapshot_file(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "json")
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, snapshot: &JobSnapshot) -> Result<(), AppError> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        let target = self.path_for(&snapshot.id);
        let staging = self.dir.join(format!("{}.json.tmp", snapshot.id));
        tokio::fs::write(&staging, encoded).await?;
        tokio::fs::rename(&staging, &target).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<JobSnapshot>, AppError> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !Self::is_snapshot_file(&path) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<JobSnapshot>(&bytes) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable job snapshot");
                }
            }
        }
        Ok(snapshots)
    }

    async fn remove(&self, job_id: &str) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
