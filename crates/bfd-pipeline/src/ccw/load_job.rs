use super::event::{RifFileEvent, RifFilesEvent};
use super::queue::DataSetQueue;
use crate::error::JobError;
use crate::jobs::{JobContext, JobOutcome, JobSchedule, JobType, PipelineJob};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub const CCW_RIF_LOAD_JOB: JobType = JobType::new("CcwRifLoadJob");

/// Loads one extract file. Called once per file, in load order.
#[async_trait]
pub trait RifFileProcessor: Send + Sync {
    /// Returns the number of records handed to the loader.
    async fn process(&self, event: &RifFileEvent) -> anyhow::Result<u64>;
}

/// Hands files to an external loader by copying them into a staging
/// directory, one subdirectory per data set.
pub struct StagingDirProcessor {
    staging_dir: PathBuf,
}

impl StagingDirProcessor {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }
}

#[async_trait]
impl RifFileProcessor for StagingDirProcessor {
    async fn process(&self, event: &RifFileEvent) -> anyhow::Result<u64> {
        let file = Arc::clone(event.file());
        let dir = self
            .staging_dir
            .join(event.timestamp().format("%Y%m%dT%H%M%SZ").to_string());

        tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let target = dir.join(file.display_name());
            let mut reader = file.open()?;
            let mut out = LineCounter::new(std::fs::File::create(&target)?);
            std::io::copy(&mut reader, &mut out)
                .with_context(|| format!("Failed to stage {}", file.display_name()))?;
            Ok(out.records())
        })
        .await
        .context("Staging task panicked")?
    }
}

/// Counts newline-terminated records passing through to `inner`.
struct LineCounter<W> {
    inner: W,
    lines: u64,
    pending: bool,
}

impl<W: std::io::Write> LineCounter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            lines: 0,
            pending: false,
        }
    }

    fn records(&self) -> u64 {
        self.lines + u64::from(self.pending)
    }
}

impl<W: std::io::Write> std::io::Write for LineCounter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        let written = &buf[..n];
        let newlines = written.iter().filter(|b| **b == b'\n').count() as u64;
        self.lines += newlines;
        if let Some(last) = written.last() {
            self.pending = *last != b'\n';
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Loads CCW data sets, one manifest per run.
pub struct CcwRifLoadJob {
    queue: DataSetQueue,
    processor: Arc<dyn RifFileProcessor>,
    run_interval: Duration,
}

impl CcwRifLoadJob {
    pub fn new(queue: DataSetQueue, processor: Arc<dyn RifFileProcessor>, run_interval: Duration) -> Self {
        Self {
            queue,
            processor,
            run_interval,
        }
    }

    async fn process_group(&self, ctx: &JobContext, group: &RifFilesEvent) -> Result<u64, JobError> {
        let mut records = 0;
        for event in group.events() {
            ctx.checkpoint()?;
            let file = event.file();
            let loaded = self
                .processor
                .process(event)
                .await
                .with_context(|| format!("Failed to load {} ({})", file.display_name(), file.file_type()))?;
            info!(file = file.display_name(), file_type = %file.file_type(), records = loaded, "Loaded RIF file");
            records += loaded;
            file.cleanup();
        }
        Ok(records)
    }
}

#[async_trait]
impl PipelineJob for CcwRifLoadJob {
    fn job_type(&self) -> JobType {
        CCW_RIF_LOAD_JOB
    }

    fn schedule(&self) -> Option<JobSchedule> {
        Some(JobSchedule::every(self.run_interval))
    }

    #[instrument(skip_all, fields(job = %ctx.id))]
    async fn call(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        ctx.checkpoint()?;

        let Some(pending) = self.queue.next_ready(Utc::now()).await? else {
            return Ok(JobOutcome::NothingToDo);
        };
        info!(manifest = %pending.manifest.id, files = pending.manifest.entries.len(), "Loading data set");

        let group = self.queue.download(ctx, &pending).await?;
        let result = self.process_group(ctx, &group).await;
        group.files().iter().for_each(|f| f.cleanup());
        let records = result?;

        self.queue.mark_done(&pending).await;
        info!(manifest = %pending.manifest.id, records, "Data set loaded");
        Ok(JobOutcome::WorkDone)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ccw::file_type::RifFileType;
    use crate::jobs::{JobArguments, JobId};
    use crate::storage::{MemoryObjectStore, RetryPolicy};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// Records the order files arrive in, optionally cancelling after the first.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, RifFileType)>>,
        cancel_after_first: Option<CancellationToken>,
        fail_on: Option<RifFileType>,
    }

    #[async_trait]
    impl RifFileProcessor for Recorder {
        async fn process(&self, event: &RifFileEvent) -> anyhow::Result<u64> {
            let file = event.file();
            if self.fail_on == Some(file.file_type()) {
                anyhow::bail!("loader rejected {}", file.display_name());
            }
            self.seen
                .lock()
                .unwrap()
                .push((file.display_name().to_string(), file.file_type()));
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            Ok(1)
        }
    }

    const TS: &str = "2024-03-01T00:00:00Z";

    async fn seeded_store() -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        let manifest = format!(
            r#"<dataSetManifest timestamp="{TS}" sequenceId="0">
                <entry name="inpatient.txt" type="INPATIENT"/>
                <entry name="carrier.txt" type="CARRIER"/>
                <entry name="bene.txt" type="BENEFICIARY"/>
            </dataSetManifest>"#
        );
        store.insert(format!("Incoming/{TS}/0_manifest.xml"), manifest).await;
        for name in ["inpatient.txt", "carrier.txt", "bene.txt"] {
            store.insert(format!("Incoming/{TS}/{name}"), "a|b\nc|d\n").await;
        }
        store
    }

    fn job(store: Arc<MemoryObjectStore>, temp: &std::path::Path, processor: Arc<dyn RifFileProcessor>) -> CcwRifLoadJob {
        // generous age so the fixed timestamp stays eligible
        let queue = DataSetQueue::new(store, temp, RetryPolicy::with_attempts(2), chrono::Duration::days(36_500));
        CcwRifLoadJob::new(queue, processor, Duration::from_secs(60))
    }

    fn ctx(token: CancellationToken) -> JobContext {
        JobContext::new(JobId::new(), JobArguments::None, token)
    }

    #[tokio::test]
    async fn test_loads_in_dependency_order_and_moves_to_done() {
        let store = seeded_store().await;
        let temp = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let job = job(Arc::clone(&store), temp.path(), recorder.clone());

        let outcome = job.call(&ctx(CancellationToken::new())).await.unwrap();
        assert_eq!(outcome, JobOutcome::WorkDone);

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["bene.txt", "carrier.txt", "inpatient.txt"]
        );
        assert!(store.contains(&format!("Done/{TS}/0_manifest.xml")).await);
        assert!(!store.contains(&format!("Incoming/{TS}/bene.txt")).await);

        // temp files are gone and there is nothing left to do
        let leftover = std::fs::read_dir(temp.path())
            .unwrap()
            .flat_map(|d| std::fs::read_dir(d.unwrap().path()).unwrap())
            .count();
        assert_eq!(leftover, 0);
        assert_eq!(
            job.call(&ctx(CancellationToken::new())).await.unwrap(),
            JobOutcome::NothingToDo
        );
    }

    #[tokio::test]
    async fn test_cancellation_between_files_leaves_set_incoming() {
        let store = seeded_store().await;
        let temp = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let recorder = Arc::new(Recorder {
            cancel_after_first: Some(token.clone()),
            ..Default::default()
        });
        let job = job(Arc::clone(&store), temp.path(), recorder.clone());

        let err = job.call(&ctx(token)).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert!(store.contains(&format!("Incoming/{TS}/0_manifest.xml")).await);
    }

    #[tokio::test]
    async fn test_processor_failure_fails_job_without_moving() {
        let store = seeded_store().await;
        let temp = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder {
            fail_on: Some(RifFileType::Carrier),
            ..Default::default()
        });
        let job = job(Arc::clone(&store), temp.path(), recorder.clone());

        let err = job.call(&ctx(CancellationToken::new())).await.unwrap_err();
        assert!(format!("{err:#}").contains("carrier.txt"));
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert!(store.contains(&format!("Incoming/{TS}/carrier.txt")).await);
    }

    #[tokio::test]
    async fn test_staging_processor_copies_and_counts() {
        let staging = tempfile::tempdir().unwrap();
        let processor = StagingDirProcessor::new(staging.path());
        let group = RifFilesEvent::new(
            TS.parse().unwrap(),
            false,
            vec![Arc::new(crate::ccw::event::InMemoryRifFile::new(
                "bene.txt",
                RifFileType::Beneficiary,
                b"h1|h2\nv1|v2\nlast".to_vec(),
            ))],
        );

        let records = processor.process(&group.events()[0]).await.unwrap();
        assert_eq!(records, 3);
        let staged = staging.path().join("20240301T000000Z").join("bene.txt");
        assert_eq!(std::fs::read(staged).unwrap(), b"h1|h2\nv1|v2\nlast");
    }
}
