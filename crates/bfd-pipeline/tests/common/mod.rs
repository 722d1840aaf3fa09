//! Shared helpers for the pipeline integration tests
//!
//! Postgres-backed tests start a throwaway container through testcontainers
//! and are `#[ignore]`d by default. Run them with:
//!
//! ```bash
//! cargo test -p bfd-pipeline --test postgres_tests -- --ignored --nocapture
//! ```

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bfd_pipeline::config::ManagerConfig;
use bfd_pipeline::jobs::{JobContext, JobOutcome, JobType, PipelineJob};
use bfd_pipeline::JobError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Semaphore;
use tracing::info;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bfd_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Fast ticks so tests do not wait on production intervals.
pub fn fast_manager_config(worker_slots: usize) -> ManagerConfig {
    ManagerConfig {
        worker_slots,
        volunteer_tick: Duration::from_millis(10),
        scheduler_tick: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(1),
    }
}

/// Poll `check` until it holds, failing the test after `limit`.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(limit, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within {limit:?}");
}

/// Counts its runs and finishes immediately.
pub struct CountingJob {
    job_type: JobType,
    pub runs: AtomicUsize,
}

impl CountingJob {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineJob for CountingJob {
    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    async fn call(&self, _ctx: &JobContext) -> Result<JobOutcome, JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(JobOutcome::WorkDone)
    }
}

/// Runs until a permit is released through [`GatedJob::release`], or until
/// cancelled when interruptible.
pub struct GatedJob {
    job_type: JobType,
    interruptible: bool,
    gate: Semaphore,
    pub started: AtomicUsize,
}

impl GatedJob {
    pub fn new(job_type: JobType, interruptible: bool) -> Self {
        Self {
            job_type,
            interruptible,
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        }
    }

    pub fn release(&self, runs: usize) {
        self.gate.add_permits(runs);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineJob for GatedJob {
    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    async fn call(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            permit = self.gate.acquire() => {
                permit.map_err(|e| JobError::Other(e.into()))?.forget();
                Ok(JobOutcome::WorkDone)
            }
            _ = ctx.cancelled() => Err(JobError::Cancelled),
        }
    }
}

/// PostgreSQL container with a ready connection pool and the pipeline tables.
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL container");
        let container = Postgres::default().with_tag("16-alpine").start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432.tcp()).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await?;

        bfd_pipeline::db::ensure_schema(&pool).await?;
        info!(%connection_string, "PostgreSQL ready");

        Ok(Self {
            _container: container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}
