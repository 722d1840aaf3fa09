//! Batch sinks
//!
//! A sink commits transformed records to some destination, one at a time and
//! strictly in order. When a write fails the caller learns exactly how many
//! commits landed first, through [`ProcessingFailure::processed_count`], and
//! can resume from there.

use async_trait::async_trait;
use thiserror::Error;

pub mod jsonl;
pub mod memory;
pub mod postgres;

pub use jsonl::{JsonLinesSink, JsonLinesTarget};
pub use memory::MemorySink;
pub use postgres::{PgClaimSink, PgClaimTarget};

/// A write that did not fully land.
///
/// `processed_count` commits were durably applied before `cause` stopped
/// the write.
#[derive(Error, Debug)]
#[error("processing failed after {processed_count} committed records: {cause:#}")]
pub struct ProcessingFailure {
    pub cause: anyhow::Error,
    pub processed_count: u64,
}

impl ProcessingFailure {
    pub fn new(cause: impl Into<anyhow::Error>, processed_count: u64) -> Self {
        Self {
            cause: cause.into(),
            processed_count,
        }
    }

    /// Same failure, counting `earlier` commits made before the failing write.
    pub fn after(self, earlier: u64) -> Self {
        Self {
            processed_count: self.processed_count + earlier,
            ..self
        }
    }
}

#[async_trait]
pub trait BatchSink<T>: Send
where
    T: Send + Sync + 'static,
{
    /// Commit one record, returning the number of commits it took (normally 1).
    async fn write_one(&mut self, record: &T) -> Result<u64, ProcessingFailure>;

    /// Commit `records` in order, stopping at the first failure.
    ///
    /// A failure reports the commits of every earlier record plus whatever
    /// the failing record itself managed. Later records are not attempted.
    async fn write_batch(&mut self, records: &[T]) -> Result<u64, ProcessingFailure> {
        let mut committed = 0;
        for record in records {
            match self.write_one(record).await {
                Ok(count) => committed += count,
                Err(failure) => return Err(failure.after(committed)),
            }
        }
        Ok(committed)
    }

    /// Release the destination. Later calls are no-ops.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens a fresh sink for each job run.
#[async_trait]
pub trait SinkFactory<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn open(&self) -> anyhow::Result<Box<dyn BatchSink<T>>>;
}
