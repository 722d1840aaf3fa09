//! Job model and execution
//!
//! Work is described by [`JobRecord`]s held in the [`JobRecordStore`]. The
//! [`PipelineManager`] runs records on a bounded set of worker slots, the
//! [`VolunteerJob`] keeps those slots busy with pending records and the
//! [`SchedulerJob`] submits new records for recurring jobs.

use async_trait::async_trait;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

pub mod manager;
pub mod record;
pub mod scheduler;
pub mod store;
pub mod volunteer;

pub use manager::{ManagerError, PipelineManager};
pub use record::{JobId, JobRecord, JobState};
pub use scheduler::SchedulerJob;
pub use store::{JobRecordStore, StoreError, Submission};
pub use volunteer::VolunteerJob;

/// Registry key for a job implementation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobType(Cow<'static, str>);

impl JobType {
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobType {
    fn from(name: String) -> Self {
        Self(Cow::Owned(name))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable parameters carried by a job record
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum JobArguments {
    #[default]
    None,
    /// A single object to process
    File { key: String },
    Json(serde_json::Value),
}

/// Fixed delay between runs of a recurring job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobSchedule {
    pub repeat_delay: Duration,
}

impl JobSchedule {
    pub fn every(repeat_delay: Duration) -> Self {
        Self { repeat_delay }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    WorkDone,
    NothingToDo,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobOutcome::WorkDone => "WORK_DONE",
            JobOutcome::NothingToDo => "NOTHING_TO_DO",
        })
    }
}

/// What a running job knows about the record it was started for
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub arguments: JobArguments,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(id: JobId, arguments: JobArguments, cancel: CancellationToken) -> Self {
        Self {
            id,
            arguments,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(JobError::Cancelled)` if cancellation was requested, for use with `?`
    /// at iteration boundaries.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A job implementation registered with the manager.
#[async_trait]
pub trait PipelineJob: Send + Sync + 'static {
    fn job_type(&self) -> JobType;

    /// Recurring jobs return their run interval.
    fn schedule(&self) -> Option<JobSchedule> {
        None
    }

    /// Interruptible jobs receive the shutdown signal through their context.
    /// Others see a token that never fires and are only stopped by abort.
    fn is_interruptible(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &JobContext) -> Result<JobOutcome, JobError>;
}
