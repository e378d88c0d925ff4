use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use state_machines::state_machine;

use crate::error::AppError;

use super::{
    document::ContentKind,
    progress_event::{JobOutcome, JobStage, ProgressEvent},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Validates `event` against the job lifecycle and returns the resulting status.
    pub fn transition(&self, event: JobTransition) -> Result<JobStatus, AppError> {
        compute_next_state(self, event)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Start,
    Succeed,
    Fail,
    Cancel,
}

impl JobTransition {
    fn as_str(self) -> &'static str {
        match self {
            JobTransition::Start => "start",
            JobTransition::Succeed => "succeed",
            JobTransition::Fail => "fail",
            JobTransition::Cancel => "cancel",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Queued,
        states: [Queued, Running, Success, Failed, Cancelled],
        events {
            start {
                transition: { from: Queued, to: Running }
            }
            succeed {
                transition: { from: Running, to: Success }
            }
            fail {
                transition: { from: Queued, to: Failed }
                transition: { from: Running, to: Failed }
            }
            cancel {
                transition: { from: Queued, to: Cancelled }
                transition: { from: Running, to: Cancelled }
            }
        }
    }

    pub(super) fn queued() -> JobLifecycleMachine<(), Queued> {
        JobLifecycleMachine::new(())
    }
}

fn invalid_transition(state: &JobStatus, event: JobTransition) -> AppError {
    AppError::InternalError(format!(
        "Invalid job transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::queued;
    match (state, event) {
        (JobStatus::Queued, JobTransition::Start) => queued()
            .start()
            .map(|_| JobStatus::Running)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Queued, JobTransition::Fail) => queued()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Queued, JobTransition::Cancel) => queued()
            .cancel()
            .map(|_| JobStatus::Cancelled)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Running, JobTransition::Succeed) => queued()
            .start()
            .map_err(|_| invalid_transition(state, event))?
            .succeed()
            .map(|_| JobStatus::Success)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Running, JobTransition::Fail) => queued()
            .start()
            .map_err(|_| invalid_transition(state, event))?
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Running, JobTransition::Cancel) => queued()
            .start()
            .map_err(|_| invalid_transition(state, event))?
            .cancel()
            .map(|_| JobStatus::Cancelled)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

/// Copied-out view of a job, also the unit persisted by a `JobStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub document_id: String,
    pub document_kind: ContentKind,
    pub document_title: Option<String>,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: u8,
    pub events: Vec<ProgressEvent>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn chunk_count(&self) -> Option<usize> {
        self.outcome.as_ref().map(|outcome| outcome.chunk_count)
    }
}
