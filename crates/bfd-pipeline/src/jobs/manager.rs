//! Bounded-concurrency job executor
//!
//! Each enqueued record runs as its own tokio task, gated by a semaphore with
//! one permit per worker slot. Enqueueing beyond capacity is allowed: the
//! extra tasks simply wait for a permit.

use super::{
    scheduler::ScheduledJob, JobArguments, JobContext, JobId, JobOutcome, JobRecord,
    JobRecordStore, JobType, PipelineJob, SchedulerJob, StoreError, VolunteerJob,
};
use crate::config::ManagerConfig;
use crate::error::JobError;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("no job registered for type {0}")]
    UnknownJobType(JobType),

    #[error("a job is already registered for type {0}")]
    DuplicateJobType(JobType),

    #[error("manager already started")]
    AlreadyStarted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The part of the manager the volunteer loop drives.
#[async_trait]
pub trait JobEnqueuer: Send + Sync {
    /// Advisory free capacity; never a reservation.
    fn open_slots(&self) -> usize;

    /// Claim and start `record`. `Ok(false)` when it was already claimed or the
    /// manager is shutting down.
    async fn enqueue(&self, record: &JobRecord) -> Result<bool, ManagerError>;
}

/// Decrements the in-flight count however the task ends, abort included.
struct SlotGuard(Arc<Inner>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    store: Arc<JobRecordStore>,
    jobs: RwLock<HashMap<JobType, Arc<dyn PipelineJob>>>,
    worker_slots: usize,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    shutdown: CancellationToken,
    running: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl Inner {
    fn open_slots(&self) -> usize {
        self.worker_slots
            .saturating_sub(self.in_flight.load(Ordering::SeqCst))
    }

    async fn run_record(self: Arc<Self>, job: Arc<dyn PipelineJob>, record: JobRecord) {
        let slot = SlotGuard(Arc::clone(&self));
        let id = record.id;

        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            debug!(%id, "Shutdown before a worker slot freed up");
            drop(slot);
            self.settle(id, Err(JobError::Cancelled)).await;
            self.forget(id).await;
            return;
        };

        if let Err(e) = self.store.record_start(id).await {
            error!(%id, error = %e, "Failed to mark job started");
            drop(slot);
            self.forget(id).await;
            return;
        }

        let cancel = if job.is_interruptible() {
            self.shutdown.child_token()
        } else {
            CancellationToken::new()
        };
        let ctx = JobContext::new(id, record.arguments.clone(), cancel);

        info!("▶ Job started");
        let result = AssertUnwindSafe(job.call(&ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(JobError::Other(anyhow::anyhow!("job panicked"))));

        // free the slot before the record turns terminal, so anyone who sees
        // the result also sees the capacity
        drop(permit);
        drop(slot);
        self.settle(id, result).await;
        self.forget(id).await;
    }

    async fn settle(&self, id: JobId, result: Result<JobOutcome, JobError>) {
        let recorded = match result {
            Ok(outcome) => {
                info!(%outcome, "✓ Job completed");
                self.store.record_completion(id, outcome).await
            },
            Err(JobError::Cancelled) => {
                info!("Job cancelled");
                self.store.record_cancellation(id).await
            },
            Err(e) => {
                error!(error = %e, "✗ Job failed");
                self.store.record_failure(id, format!("{e:#}")).await
            },
        };
        if let Err(e) = recorded {
            warn!(%id, error = %e, "Could not record job result");
        }
    }

    async fn forget(&self, id: JobId) {
        self.running.lock().await.remove(&id);
    }
}

/// Runs job records on a fixed number of worker slots.
#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
    config: ManagerConfig,
    started: Arc<AtomicBool>,
}

impl PipelineManager {
    pub fn new(store: Arc<JobRecordStore>, config: ManagerConfig) -> Self {
        let inner = Inner {
            store,
            jobs: RwLock::new(HashMap::new()),
            worker_slots: config.worker_slots,
            permits: Arc::new(Semaphore::new(config.worker_slots)),
            in_flight: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
            config,
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<JobRecordStore> {
        &self.inner.store
    }

    pub async fn register_job(&self, job: Arc<dyn PipelineJob>) -> Result<(), ManagerError> {
        let job_type = job.job_type();
        let mut jobs = self.inner.jobs.write().await;
        if jobs.contains_key(&job_type) {
            return Err(ManagerError::DuplicateJobType(job_type));
        }
        info!(%job_type, interruptible = job.is_interruptible(), "Registered job");
        jobs.insert(job_type, job);
        Ok(())
    }

    pub fn open_slots(&self) -> usize {
        self.inner.open_slots()
    }

    pub fn worker_slots(&self) -> usize {
        self.inner.worker_slots
    }

    /// Claim `record` and run it as soon as a worker slot is free.
    ///
    /// A record whose type is not registered is marked FAILED and
    /// [`ManagerError::UnknownJobType`] is returned.
    pub async fn enqueue(&self, record: &JobRecord) -> Result<bool, ManagerError> {
        enqueue(&self.inner, record).await
    }

    /// Launch the volunteer and scheduler loops.
    ///
    /// Both hold a worker slot until [`stop`](Self::stop), so everything else
    /// shares `worker_slots - 2`.
    pub async fn start(&self) -> Result<(), ManagerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let scheduled: Vec<ScheduledJob> = self
            .inner
            .jobs
            .read()
            .await
            .values()
            .filter_map(|job| {
                job.schedule().map(|schedule| ScheduledJob {
                    job_type: job.job_type(),
                    schedule,
                })
            })
            .collect();

        let volunteer = Arc::new(VolunteerJob::new(
            self.handle(),
            Arc::clone(&self.inner.store),
            self.config.volunteer_tick,
        ));
        let scheduler = Arc::new(SchedulerJob::new(
            Arc::clone(&self.inner.store),
            scheduled,
            self.config.scheduler_tick,
        ));

        for job in [volunteer as Arc<dyn PipelineJob>, scheduler as Arc<dyn PipelineJob>] {
            let job_type = job.job_type();
            self.register_job(job).await?;
            let record = self
                .inner
                .store
                .submit(job_type, JobArguments::None, None)
                .await;
            self.enqueue(&record).await?;
        }

        info!(worker_slots = self.inner.worker_slots, "Pipeline manager started");
        Ok(())
    }

    /// Signal cancellation and wait up to `grace` for running jobs to exit.
    ///
    /// Jobs still running after `grace` are aborted and recorded CANCELLED.
    pub async fn stop(&self, grace: Duration) {
        info!(?grace, "Stopping pipeline manager");
        self.inner.shutdown.cancel();

        let running: Vec<(JobId, JoinHandle<()>)> =
            self.inner.running.lock().await.drain().collect();
        let deadline = tokio::time::Instant::now() + grace;

        for (id, mut handle) in running {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(%id, error = %e, "Job task ended abnormally"),
                Err(_) => {
                    warn!(%id, "Job ignored cancellation; aborting");
                    handle.abort();
                    // wait for the abort so the slot guard has dropped
                    let _ = handle.await;
                    if let Err(e) = self.inner.store.record_cancellation(id).await {
                        warn!(%id, error = %e, "Could not record cancellation");
                    }
                },
            }
        }
        info!("Pipeline manager stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Weak handle for components that must not keep the manager alive.
    pub fn handle(&self) -> Arc<dyn JobEnqueuer> {
        Arc::new(ManagerHandle(Arc::downgrade(&self.inner)))
    }
}

async fn enqueue(inner: &Arc<Inner>, record: &JobRecord) -> Result<bool, ManagerError> {
    if inner.shutdown.is_cancelled() {
        return Ok(false);
    }

    let registered = inner.jobs.read().await.get(&record.job_type).cloned();
    let Some(job) = registered else {
        let err = ManagerError::UnknownJobType(record.job_type.clone());
        // fail the record so it stops heading the pending queue
        if inner.store.claim(record.id).await? {
            inner.store.record_failure(record.id, err.to_string()).await?;
        }
        return Err(err);
    };

    // hold the map while spawning so the task cannot remove itself first
    let mut running = inner.running.lock().await;
    if !inner.store.claim(record.id).await? {
        debug!(id = %record.id, "Job record already claimed");
        return Ok(false);
    }

    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    let span = tracing::info_span!("job", id = %record.id, job_type = %record.job_type);
    let handle = tokio::spawn(
        Arc::clone(inner)
            .run_record(job, record.clone())
            .instrument(span),
    );
    running.insert(record.id, handle);
    Ok(true)
}

/// Non-owning enqueuer given to the volunteer loop.
struct ManagerHandle(Weak<Inner>);

#[async_trait]
impl JobEnqueuer for ManagerHandle {
    fn open_slots(&self) -> usize {
        self.0.upgrade().map_or(0, |inner| inner.open_slots())
    }

    async fn enqueue(&self, record: &JobRecord) -> Result<bool, ManagerError> {
        match self.0.upgrade() {
            Some(inner) => enqueue(&inner, record).await,
            None => Ok(false),
        }
    }
}
