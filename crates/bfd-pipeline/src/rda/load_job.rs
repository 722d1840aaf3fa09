use super::dead_letter::{DeadLetter, DeadLetterStore};
use super::message::{ChangeType, ClaimChange, ClaimType};
use super::progress::ProgressStore;
use super::source::{ChangeStream, ClaimChangeSource, StreamError};
use super::transform::{ClaimTransformer, TransformError, TransformedClaim};
use crate::config::{DEFAULT_RDA_BATCH_SIZE, DEFAULT_RDA_RUN_INTERVAL_SECS};
use crate::error::JobError;
use crate::jobs::{JobContext, JobOutcome, JobSchedule, JobType, PipelineJob};
use crate::sink::{BatchSink, SinkFactory};
use crate::storage::RetryPolicy;
use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub const RDA_FISS_LOAD_JOB: JobType = JobType::new("RdaLoadJob:fiss");
pub const RDA_MCS_LOAD_JOB: JobType = JobType::new("RdaLoadJob:mcs");

/// Each claim type streams independently, so each gets its own job type.
pub fn job_type_for(claim_type: ClaimType) -> JobType {
    match claim_type {
        ClaimType::Fiss => RDA_FISS_LOAD_JOB,
        ClaimType::Mcs => RDA_MCS_LOAD_JOB,
    }
}

#[derive(Debug, Clone)]
pub struct RdaLoadOptions {
    pub claim_type: ClaimType,
    pub batch_size: usize,
    /// Where to start when no progress has been recorded yet
    pub starting_sequence: Option<i64>,
    pub run_interval: Duration,
    /// Applied to opening the stream, to reopening it after an interruption,
    /// and to every progress and dead letter call
    pub retry: RetryPolicy,
    /// Offer dead letters with a sequence number again before streaming
    pub replay_dead_letters: bool,
}

impl RdaLoadOptions {
    pub fn new(claim_type: ClaimType) -> Self {
        Self {
            claim_type,
            batch_size: DEFAULT_RDA_BATCH_SIZE,
            starting_sequence: None,
            run_interval: Duration::from_secs(DEFAULT_RDA_RUN_INTERVAL_SECS),
            retry: RetryPolicy::default(),
            replay_dead_letters: true,
        }
    }
}

/// What became of one change.
enum Accepted {
    Claim(TransformedClaim),
    Rejected(String),
}

/// How a pass over the stream ended.
enum StreamEnd {
    Finished,
    Interrupted { error: anyhow::Error, received: bool },
}

#[derive(Debug, Default)]
struct RunTotals {
    committed: u64,
    dead_lettered: u64,
}

/// Streams claim changes into a sink in batches, recording progress after
/// every commit so a restart resumes without gaps or repeats.
///
/// Changes that cannot be applied are dead-lettered and passed over.
pub struct RdaLoadJob {
    options: RdaLoadOptions,
    source: Arc<dyn ClaimChangeSource>,
    transformer: ClaimTransformer,
    sinks: Arc<dyn SinkFactory<TransformedClaim>>,
    progress: Arc<dyn ProgressStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
}

impl RdaLoadJob {
    pub fn new(
        options: RdaLoadOptions,
        source: Arc<dyn ClaimChangeSource>,
        transformer: ClaimTransformer,
        sinks: Arc<dyn SinkFactory<TransformedClaim>>,
        progress: Arc<dyn ProgressStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            options,
            source,
            transformer,
            sinks,
            progress,
            dead_letters,
        }
    }

    fn claim_type(&self) -> ClaimType {
        self.options.claim_type
    }

    /// Run `op` until it succeeds or has failed `retry.max_attempts` times.
    async fn with_retry<T, F, Fut>(
        &self,
        ctx: &JobContext,
        what: &str,
        mut op: F,
    ) -> Result<T, JobError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    return Err(JobError::Transient(
                        e.context(format!("{what} failed after {attempt} attempts")),
                    ));
                },
                Err(e) => {
                    let delay = self.options.retry.backoff(attempt);
                    warn!(error = %format!("{e:#}"), attempt, ?delay, "{what} failed; retrying");
                    self.pause(ctx, delay).await?;
                },
            }
        }
    }

    async fn pause(&self, ctx: &JobContext, delay: Duration) -> Result<(), JobError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(JobError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn starting_sequence(&self, ctx: &JobContext) -> Result<i64, JobError> {
        let recorded = self
            .with_retry(ctx, "Reading stream progress", || {
                self.progress.last_sequence(self.claim_type())
            })
            .await?;
        Ok(match recorded {
            Some(last) => last + 1,
            None => self.options.starting_sequence.unwrap_or(0),
        })
    }

    async fn open(&self, ctx: &JobContext, start: i64) -> Result<ChangeStream, JobError> {
        self.with_retry(ctx, "Opening claim change stream", || {
            self.source.open_stream(self.claim_type(), start)
        })
        .await
    }

    /// Transform `change` and check it belongs on this stream.
    ///
    /// Only hashing failures are fatal; they would hit every change alike.
    fn accept(&self, change: &ClaimChange) -> Result<Accepted, JobError> {
        match self.transformer.transform(change) {
            Ok(claim) if claim.claim_type != self.claim_type() => Ok(Accepted::Rejected(format!(
                "{} change on the {} stream",
                claim.claim_type,
                self.claim_type()
            ))),
            Ok(claim) => Ok(Accepted::Claim(claim)),
            Err(e @ TransformError::Unsupported { .. }) => Ok(Accepted::Rejected(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(
        &self,
        ctx: &JobContext,
        letter: DeadLetter,
        totals: &mut RunTotals,
    ) -> Result<(), JobError> {
        let recorded = self
            .with_retry(ctx, "Recording dead letter", || self.dead_letters.record(&letter))
            .await?;
        if recorded {
            error!(
                sequence = ?letter.sequence,
                location = %letter.location,
                reason = %letter.reason,
                "Dead-lettered claim change"
            );
            totals.dead_lettered += 1;
        } else {
            debug!(location = %letter.location, "Claim change already dead-lettered");
        }
        Ok(())
    }

    /// Offer every dead letter with a sequence number to the sink again.
    ///
    /// A letter whose change still fails, or cannot be fetched, stays put.
    async fn replay_dead_letters(
        &self,
        ctx: &JobContext,
        sink: &mut dyn BatchSink<TransformedClaim>,
        totals: &mut RunTotals,
    ) -> Result<(), JobError> {
        let letters = self
            .with_retry(ctx, "Reading dead letters", || {
                self.dead_letters.unresolved(self.claim_type())
            })
            .await?;
        let replayable: Vec<(i64, DeadLetter)> = letters
            .into_iter()
            .filter_map(|l| l.sequence.map(|s| (s, l)))
            .collect();
        if replayable.is_empty() {
            return Ok(());
        }
        info!(count = replayable.len(), "Replaying dead-lettered claim changes");

        for (sequence, letter) in replayable {
            ctx.checkpoint()?;
            let Some(change) = self.refetch(ctx, sequence).await? else {
                continue;
            };
            if change.change_type != ChangeType::Delete {
                match self.accept(&change)? {
                    Accepted::Claim(claim) => {
                        totals.committed += sink.write_one(&claim).await?;
                    },
                    Accepted::Rejected(reason) => {
                        debug!(sequence, %reason, "Dead-lettered change still rejected");
                        continue;
                    },
                }
            }
            self.with_retry(ctx, "Resolving dead letter", || {
                self.dead_letters.resolve(self.claim_type(), &letter.location)
            })
            .await?;
            info!(sequence, "Dead-lettered claim change loaded");
        }
        Ok(())
    }

    /// Read the change at exactly `sequence` from a fresh stream.
    async fn refetch(&self, ctx: &JobContext, sequence: i64) -> Result<Option<ClaimChange>, JobError> {
        let mut stream = self.open(ctx, sequence).await?;
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(JobError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(change)) if change.sequence == sequence => return Ok(Some(change)),
                Some(Ok(_)) | None => {
                    warn!(sequence, "Dead-lettered change is no longer in the stream");
                    return Ok(None);
                },
                Some(Err(StreamError::Malformed { sequence: Some(s), .. })) if s == sequence => {
                    return Ok(None)
                },
                Some(Err(StreamError::Malformed { .. })) => continue,
                Some(Err(StreamError::Transient(e))) => {
                    warn!(sequence, error = %format!("{e:#}"), "Could not refetch dead-lettered change");
                    return Ok(None);
                },
            }
        }
    }

    /// Read `stream` to its end, committing in batches.
    ///
    /// An interrupted stream is reported rather than failed; the batch read
    /// so far is flushed first so the reopen starts after it.
    async fn consume(
        &self,
        ctx: &JobContext,
        mut stream: ChangeStream,
        sink: &mut dyn BatchSink<TransformedClaim>,
        totals: &mut RunTotals,
    ) -> Result<StreamEnd, JobError> {
        let batch_size = self.options.batch_size.max(1);
        let mut batch: Vec<TransformedClaim> = Vec::with_capacity(batch_size);
        // highest sequence read, applied or not
        let mut consumed: Option<i64> = None;
        let mut received = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    info!(discarded = batch.len(), "Cancelled; unflushed changes will be re-read next run");
                    return Err(JobError::Cancelled);
                }
                next = stream.next() => next,
            };

            let change = match next {
                None => break,
                Some(Ok(change)) => change,
                Some(Err(StreamError::Malformed { sequence, location, reason })) => {
                    received = true;
                    consumed = consumed.max(sequence);
                    let letter = DeadLetter::new(self.claim_type(), sequence, location, reason);
                    self.dead_letter(ctx, letter, totals).await?;
                    continue;
                },
                Some(Err(StreamError::Transient(error))) => {
                    totals.committed += self.flush(ctx, &mut batch, sink, consumed).await?;
                    return Ok(StreamEnd::Interrupted { error, received });
                },
            };
            received = true;
            consumed = consumed.max(Some(change.sequence));

            if change.change_type == ChangeType::Delete {
                debug!(sequence = change.sequence, "Skipping delete change");
                continue;
            }

            let claim = match self.accept(&change) {
                Ok(Accepted::Claim(claim)) => claim,
                Ok(Accepted::Rejected(reason)) => {
                    let letter = DeadLetter::new(
                        self.claim_type(),
                        Some(change.sequence),
                        DeadLetter::sequence_location(change.sequence),
                        reason,
                    );
                    self.dead_letter(ctx, letter, totals).await?;
                    continue;
                },
                Err(e) => {
                    // nothing past the last good change is recorded
                    let before = change.sequence - 1;
                    totals.committed += self.flush(ctx, &mut batch, sink, Some(before)).await?;
                    return Err(e);
                },
            };

            match batch.iter_mut().find(|c| c.claim_id == claim.claim_id) {
                Some(existing) => *existing = claim,
                None => batch.push(claim),
            }

            if batch.len() >= batch_size {
                totals.committed += self.flush(ctx, &mut batch, sink, consumed).await?;
            }
        }

        totals.committed += self.flush(ctx, &mut batch, sink, consumed).await?;
        Ok(StreamEnd::Finished)
    }

    /// Write `batch` and record how far the stream is now durably applied.
    ///
    /// `consumed` covers changes that were read but needed no write; it is
    /// recorded along with a successful batch, or alone when the batch is
    /// empty.
    async fn flush(
        &self,
        ctx: &JobContext,
        batch: &mut Vec<TransformedClaim>,
        sink: &mut dyn BatchSink<TransformedClaim>,
        consumed: Option<i64>,
    ) -> Result<u64, JobError> {
        let Some(highest) = batch.iter().map(|c| c.sequence).max() else {
            if let Some(consumed) = consumed {
                self.record(ctx, consumed).await?;
            }
            return Ok(0);
        };

        match sink.write_batch(batch).await {
            Ok(count) => {
                let through = consumed.map_or(highest, |c| c.max(highest));
                self.record(ctx, through).await?;
                info!(records = batch.len(), commits = count, sequence = through, "Committed batch");
                batch.clear();
                Ok(count)
            },
            Err(failure) => {
                // one commit per claim, so the count is also the committed prefix length
                let prefix = usize::try_from(failure.processed_count)
                    .unwrap_or(usize::MAX)
                    .min(batch.len());
                // dedup can leave sequences out of order, so stop short of the
                // earliest change that did not land
                if let Some(first_missing) = batch[prefix..].iter().map(|c| c.sequence).min() {
                    if prefix > 0 {
                        self.record(ctx, first_missing - 1).await?;
                    }
                }
                warn!(committed = prefix, attempted = batch.len(), "Batch partially committed");
                Err(failure.into())
            },
        }
    }

    async fn record(&self, ctx: &JobContext, sequence: i64) -> Result<(), JobError> {
        self.with_retry(ctx, "Recording stream progress", || {
            self.progress.record_sequence(self.claim_type(), sequence)
        })
        .await
    }

    async fn run(
        &self,
        ctx: &JobContext,
        sink: &mut dyn BatchSink<TransformedClaim>,
        totals: &mut RunTotals,
    ) -> Result<(), JobError> {
        if self.options.replay_dead_letters {
            self.replay_dead_letters(ctx, sink, totals).await?;
        }

        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut interruptions = 0;
        loop {
            let start = self.starting_sequence(ctx).await?;
            let stream = self.open(ctx, start).await?;
            info!(start, "Reading claim changes");

            match self.consume(ctx, stream, sink, totals).await? {
                StreamEnd::Finished => return Ok(()),
                StreamEnd::Interrupted { error, received } => {
                    // only consecutive interruptions without progress count
                    interruptions = if received { 1 } else { interruptions + 1 };
                    if interruptions >= max_attempts {
                        return Err(JobError::Transient(error.context(format!(
                            "Claim change stream failed {interruptions} times in a row"
                        ))));
                    }
                    let delay = self.options.retry.backoff(interruptions);
                    warn!(error = %format!("{error:#}"), ?delay, "Claim change stream interrupted; reopening");
                    self.pause(ctx, delay).await?;
                },
            }
        }
    }
}

#[async_trait]
impl PipelineJob for RdaLoadJob {
    fn job_type(&self) -> JobType {
        job_type_for(self.claim_type())
    }

    fn schedule(&self) -> Option<JobSchedule> {
        Some(JobSchedule::every(self.options.run_interval))
    }

    #[instrument(skip_all, fields(job = %ctx.id, claim_type = %self.options.claim_type))]
    async fn call(&self, ctx: &JobContext) -> Result<JobOutcome, JobError> {
        ctx.checkpoint()?;

        let mut sink = self.sinks.open().await?;
        let mut totals = RunTotals::default();
        let result = self.run(ctx, sink.as_mut(), &mut totals).await;
        if let Err(e) = sink.close().await {
            warn!(error = %format!("{e:#}"), "Failed to close sink");
        }

        result?;
        info!(committed = totals.committed, dead_lettered = totals.dead_lettered, "Claim change run finished");
        Ok(if totals.committed + totals.dead_lettered > 0 {
            JobOutcome::WorkDone
        } else {
            JobOutcome::NothingToDo
        })
    }
}
