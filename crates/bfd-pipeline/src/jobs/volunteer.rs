//! Turns free worker capacity into started jobs

use super::manager::JobEnqueuer;
use super::{JobContext, JobOutcome, JobRecordStore, JobType, PipelineJob};
use crate::error::JobError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const VOLUNTEER_JOB: JobType = JobType::new("VolunteerJob");

/// Long-running job that polls the store for pending records.
///
/// Each tick enqueues at most `open_slots()` records and then sleeps for the
/// tick interval, even when nothing was found, so no job can be started more
/// often than once per tick.
pub struct VolunteerJob {
    enqueuer: Arc<dyn JobEnqueuer>,
    store: Arc<JobRecordStore>,
    tick: Duration,
}

impl VolunteerJob {
    pub fn new(enqueuer: Arc<dyn JobEnqueuer>, store: Arc<JobRecordStore>, tick: Duration) -> Self {
        Self {
            enqueuer,
            store,
            tick,
        }
    }

    /// One polling pass. Returns how many records were enqueued.
    ///
    /// A failed enqueue is logged and skipped; it never ends the pass.
    pub async fn tick(&self) -> usize {
        let open = self.enqueuer.open_slots();
        if open == 0 {
            debug!("No open worker slots");
            return 0;
        }

        let pending = self.store.find_pending_jobs(open).await;
        let mut enqueued = 0;
        for record in &pending {
            match self.enqueuer.enqueue(record).await {
                Ok(true) => enqueued += 1,
                Ok(false) => debug!(id = %record.id, "Record was taken by another caller"),
                Err(e) => warn!(id = %record.id, job_type = %record.job_type, error = %e, "Failed to enqueue job"),
            }
        }
        if enqueued > 0 {
            debug!(enqueued, open, "Volunteered pending jobs");
        }
        enqueued
    }
}

#[async_trait]
impl PipelineJob for VolunteerJob {
    fn job_type(&self) -> JobType {
        VOLUNTEER_JOB
    }

    async fn call(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        let mut outcome = JobOutcome::NothingToDo;
        while !ctx.is_cancelled() {
            if self.tick().await > 0 {
                outcome = JobOutcome::WorkDone;
            }
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {},
            }
        }
        Ok(outcome)
    }
}
