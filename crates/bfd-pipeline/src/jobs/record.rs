//! Job records and their lifecycle

use super::{JobArguments, JobOutcome, JobSchedule, JobType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Opaque job record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// Pending, claimed or running.
    pub fn is_outstanding(self) -> bool {
        !self.is_terminal()
    }

    /// Lifecycle only moves forward: PENDING -> CLAIMED -> RUNNING -> terminal.
    /// A claimed record may end without running when it is cancelled or its
    /// task dies before starting.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Claimed, Failed)
                | (Claimed, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Claimed => "CLAIMED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// A unit of schedulable work.
///
/// Only [`JobRecordStore`](super::store::JobRecordStore) changes a record's
/// state; callers always receive snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub arguments: JobArguments,
    /// Set for records submitted on behalf of a recurring job
    pub schedule: Option<JobSchedule>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the record reaches any terminal state
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
    pub failure: Option<String>,
}

impl JobRecord {
    pub(crate) fn new(
        job_type: JobType,
        arguments: JobArguments,
        schedule: Option<JobSchedule>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            arguments,
            schedule,
            state: JobState::Pending,
            created_at: Utc::now(),
            claimed_at: None,
            started_at: None,
            completed_at: None,
            outcome: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
