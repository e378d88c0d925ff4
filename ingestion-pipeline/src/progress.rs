use std::sync::Arc;

use chrono::Utc;
use common::{
    error::AppError,
    storage::types::progress_event::{JobOutcome, JobStage, ProgressEvent},
};
use futures::{stream::BoxStream, StreamExt};
use tokio::sync::watch;

#[derive(Debug, Default)]
struct EventLog {
    events: Vec<ProgressEvent>,
    closed: bool,
}

/// Append-only progress log for one job with replay-then-tail subscriptions.
///
/// The whole log lives in a watch channel. Subscribers keep an index cursor into it, so
/// history and live events come from the same vector and can neither gap nor repeat.
#[derive(Clone)]
pub struct ProgressStreamer {
    job_id: Arc<str>,
    log: Arc<watch::Sender<EventLog>>,
}

impl ProgressStreamer {
    pub fn new(job_id: &str) -> Self {
        let (sender, _) = watch::channel(EventLog::default());
        Self {
            job_id: Arc::from(job_id),
            log: Arc::new(sender),
        }
    }

    /// Rebuilds a log from persisted events. A history ending in a terminal event stays closed.
    pub fn from_history(job_id: &str, events: Vec<ProgressEvent>) -> Self {
        let closed = events.last().is_some_and(ProgressEvent::is_terminal);
        let (sender, _) = watch::channel(EventLog { events, closed });
        Self {
            job_id: Arc::from(job_id),
            log: Arc::new(sender),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Appends the next event. Progress never moves backwards: a lower value is raised to the
    /// last one. Passing an outcome closes the log.
    pub fn append(
        &self,
        stage: JobStage,
        progress: u8,
        message: Option<String>,
        outcome: Option<JobOutcome>,
    ) -> Result<ProgressEvent, AppError> {
        let mut appended: Result<ProgressEvent, AppError> = Err(AppError::InternalError(
            format!("progress log for job {} is closed", self.job_id),
        ));

        self.log.send_if_modified(|log| {
            if log.closed {
                return false;
            }
            let last = log.events.last().map_or(0, |event| event.progress);
            let event = ProgressEvent {
                job_id: self.job_id.to_string(),
                sequence: log.events.len() as u64,
                stage,
                progress: progress.min(100).max(last),
                message,
                timestamp: Utc::now(),
                outcome,
            };
            log.closed = event.is_terminal();
            log.events.push(event.clone());
            appended = Ok(event);
            true
        });

        appended
    }

    pub fn history(&self) -> Vec<ProgressEvent> {
        self.log.borrow().events.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.borrow().closed
    }

    /// Every past event, then live ones, ending after the terminal event.
    ///
    /// The stream owns its receiver, so dropping it affects nobody else.
    pub fn subscribe(&self) -> BoxStream<'static, ProgressEvent> {
        let mut receiver = self.log.subscribe();
        async_stream::stream! {
            let mut cursor = 0usize;
            loop {
                let (batch, closed) = {
                    let log = receiver.borrow_and_update();
                    let batch: Vec<ProgressEvent> =
                        log.events.get(cursor..).map(<[_]>::to_vec).unwrap_or_default();
                    (batch, log.closed)
                };
                cursor = cursor.saturating_add(batch.len());
                for event in batch {
                    yield event;
                }
                if closed || receiver.changed().await.is_err() {
                    break;
                }
            }
        }
        .boxed()
    }
}
