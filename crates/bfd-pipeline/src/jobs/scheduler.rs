//! Submits runs of recurring jobs

use super::{JobArguments, JobContext, JobOutcome, JobRecordStore, JobSchedule, JobType, PipelineJob};
use crate::error::JobError;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SCHEDULER_JOB: JobType = JobType::new("SchedulerJob");

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job_type: JobType,
    pub schedule: JobSchedule,
}

/// Long-running job that creates PENDING records for recurring jobs.
///
/// A new record is submitted once the previous run has finished and at least
/// `repeat_delay` has passed since it did.
pub struct SchedulerJob {
    store: Arc<JobRecordStore>,
    jobs: Vec<ScheduledJob>,
    tick: Duration,
}

impl SchedulerJob {
    pub fn new(store: Arc<JobRecordStore>, jobs: Vec<ScheduledJob>, tick: Duration) -> Self {
        Self { store, jobs, tick }
    }

    /// One pass over the scheduled jobs. Returns how many runs were created.
    pub async fn tick(&self) -> usize {
        let mut submitted = 0;
        for job in &self.jobs {
            if !self.is_due(job).await {
                continue;
            }
            let submission = self
                .store
                .try_submit(job.job_type.clone(), JobArguments::None, Some(job.schedule))
                .await;
            let id = submission.record().id;
            if submission.is_created() {
                info!(job_type = %job.job_type, %id, "Scheduled job run");
                submitted += 1;
            } else {
                debug!(job_type = %job.job_type, %id, "Run already submitted elsewhere");
            }
        }
        submitted
    }

    async fn is_due(&self, job: &ScheduledJob) -> bool {
        if self.store.has_outstanding(&job.job_type).await {
            return false;
        }
        let Some(last) = self.store.find_most_recent(&job.job_type).await else {
            return true;
        };
        let Some(finished) = last.completed_at else {
            return false;
        };
        let elapsed = (Utc::now() - finished).to_std().unwrap_or(Duration::ZERO);
        let due = elapsed >= job.schedule.repeat_delay;
        if !due {
            debug!(job_type = %job.job_type, ?elapsed, "Recurring job not yet due");
        }
        due
    }
}

#[async_trait]
impl PipelineJob for SchedulerJob {
    fn job_type(&self) -> JobType {
        SCHEDULER_JOB
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
