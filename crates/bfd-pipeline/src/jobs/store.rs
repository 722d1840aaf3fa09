//! In-process registry of job records
//!
//! All state transitions go through one mutex, so `claim` is a compare-and-swap
//! on PENDING and concurrent callers can never both win the same record.

use super::{JobArguments, JobId, JobOutcome, JobRecord, JobSchedule, JobState, JobType};
use chrono::Utc;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, instrument};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("job record not found: {0}")]
    NotFound(JobId),

    #[error("job record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
}

struct Entry {
    /// Submission order, breaks `created_at` ties
    seq: u64,
    record: JobRecord,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    entries: HashMap<JobId, Entry>,
}

impl Inner {
    fn ordered(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.record.created_at, e.seq));
        entries
    }
}

/// Result of [`JobRecordStore::try_submit`].
#[derive(Debug, Clone)]
pub enum Submission {
    Created(JobRecord),
    /// An outstanding recurring record that was reused
    Existing(JobRecord),
}

impl Submission {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Self::Created(record) | Self::Existing(record) => record,
        }
    }
}

#[derive(Default)]
pub struct JobRecordStore {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl JobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a PENDING record.
    ///
    /// For recurring jobs (`schedule` set) an outstanding record with the same
    /// type and schedule is returned instead of creating a second one.
    pub async fn submit(
        &self,
        job_type: JobType,
        arguments: JobArguments,
        schedule: Option<JobSchedule>,
    ) -> JobRecord {
        self.try_submit(job_type, arguments, schedule)
            .await
            .into_record()
    }

    /// Like [`submit`](Self::submit), but reports whether a record was created.
    #[instrument(skip(self, arguments))]
    pub async fn try_submit(
        &self,
        job_type: JobType,
        arguments: JobArguments,
        schedule: Option<JobSchedule>,
    ) -> Submission {
        let mut inner = self.inner.lock().await;

        if schedule.is_some() {
            let existing = inner.entries.values().find(|e| {
                e.record.job_type == job_type
                    && e.record.schedule == schedule
                    && e.record.state.is_outstanding()
            });
            if let Some(entry) = existing {
                debug!(id = %entry.record.id, "Recurring job already outstanding");
                return Submission::Existing(entry.record.clone());
            }
        }

        let record = JobRecord::new(job_type, arguments, schedule);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            record.id,
            Entry {
                seq,
                record: record.clone(),
            },
        );
        drop(inner);

        debug!(id = %record.id, "Submitted job record");
        self.changed.notify_waiters();
        Submission::Created(record)
    }

    /// Up to `limit` PENDING records, oldest first.
    pub async fn find_pending_jobs(&self, limit: usize) -> Vec<JobRecord> {
        let inner = self.inner.lock().await;
        inner
            .ordered()
            .into_iter()
            .filter(|e| e.record.state == JobState::Pending)
            .take(limit)
            .map(|e| e.record.clone())
            .collect()
    }

    /// The newest record of `job_type`, whatever its state.
    pub async fn find_most_recent(&self, job_type: &JobType) -> Option<JobRecord> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .filter(|e| &e.record.job_type == job_type)
            .max_by_key(|e| (e.record.created_at, e.seq))
            .map(|e| e.record.clone())
    }

    pub async fn has_outstanding(&self, job_type: &JobType) -> bool {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .any(|e| &e.record.job_type == job_type && e.record.state.is_outstanding())
    }

    /// Atomically move a PENDING record to CLAIMED.
    ///
    /// Returns `false` when the record is in any other state, which makes
    /// repeated or racing claims harmless.
    pub async fn claim(&self, id: JobId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.record.state != JobState::Pending {
            return Ok(false);
        }
        entry.record.state = JobState::Claimed;
        entry.record.claimed_at = Some(Utc::now());
        drop(inner);

        self.changed.notify_waiters();
        Ok(true)
    }

    pub async fn record_start(&self, id: JobId) -> Result<JobRecord, StoreError> {
        self.transition(id, JobState::Running, |record| {
            record.started_at = Some(Utc::now());
        })
        .await
    }

    pub async fn record_completion(
        &self,
        id: JobId,
        outcome: JobOutcome,
    ) -> Result<JobRecord, StoreError> {
        self.transition(id, JobState::Completed, |record| {
            record.outcome = Some(outcome);
            record.completed_at = Some(Utc::now());
        })
        .await
    }

    pub async fn record_failure(
        &self,
        id: JobId,
        failure: impl Into<String>,
    ) -> Result<JobRecord, StoreError> {
        let failure = failure.into();
        self.transition(id, JobState::Failed, |record| {
            record.failure = Some(failure);
            record.completed_at = Some(Utc::now());
        })
        .await
    }

    pub async fn record_cancellation(&self, id: JobId) -> Result<JobRecord, StoreError> {
        self.transition(id, JobState::Cancelled, |record| {
            record.completed_at = Some(Utc::now());
        })
        .await
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobState,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let from = entry.record.state;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { id, from, to });
        }
        entry.record.state = to;
        apply(&mut entry.record);
        let snapshot = entry.record.clone();
        drop(inner);

        debug!(%id, %from, %to, "Job record transition");
        self.changed.notify_waiters();
        Ok(snapshot)
    }

    pub async fn get(&self, id: JobId) -> Option<JobRecord> {
        let inner = self.inner.lock().await;
        inner.entries.get(&id).map(|e| e.record.clone())
    }

    /// Every record in submission order.
    pub async fn records(&self) -> Vec<JobRecord> {
        let inner = self.inner.lock().await;
        inner.ordered().into_iter().map(|e| e.record.clone()).collect()
    }

    /// Wait until the record reaches a terminal state.
    pub async fn wait_for_completion(&self, id: JobId) -> Result<JobRecord, StoreError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // register before checking so a transition in between is not missed
            notified.as_mut().enable();

            let record = self.get(id).await.ok_or(StoreError::NotFound(id))?;
            if record.is_terminal() {
                return Ok(record);
            }
            notified.await;
        }
    }
}
