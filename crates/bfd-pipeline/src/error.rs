//! Failure taxonomy for pipeline jobs
//!
//! A job's `call` either returns an outcome or one of these. The manager maps
//! [`JobError::Cancelled`] to a CANCELLED record and everything else to
//! FAILED; nothing here ever halts other job records.

use crate::rda::transform::TransformError;
use crate::sink::ProcessingFailure;
use crate::storage::DownloadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    /// The cancellation signal was observed. Not a failure.
    #[error("job was cancelled")]
    Cancelled,

    /// A network or service error outlasted its retry policy.
    #[error("transient failure persisted: {0:#}")]
    Transient(#[source] anyhow::Error),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    PartialBatch(#[from] ProcessingFailure),

    /// Input this pipeline cannot handle (unknown record type, bad manifest).
    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TransformError> for JobError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Unsupported { .. } => JobError::Unsupported(err.to_string()),
            TransformError::Hashing { .. } => JobError::Other(err.into()),
        }
    }
}

impl JobError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}
