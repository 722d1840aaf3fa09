//! Claims-change stream ingestion
//!
//! [`RdaLoadJob`] reads [`ClaimChange`]s from a [`ClaimChangeSource`],
//! pseudonymises them with [`ClaimTransformer`] and commits them through a
//! [`BatchSink`](crate::sink::BatchSink), tracking the last committed
//! sequence in a [`ProgressStore`]. Changes that cannot be applied go to a
//! [`DeadLetterStore`] and are offered again on later runs.

pub mod dead_letter;
pub mod load_job;
pub mod message;
pub mod progress;
pub mod source;
pub mod transform;

pub use dead_letter::{DeadLetter, DeadLetterStore, MemoryDeadLetterStore, PgDeadLetterStore};
pub use load_job::{job_type_for, RdaLoadJob, RdaLoadOptions, RDA_FISS_LOAD_JOB, RDA_MCS_LOAD_JOB};
pub use message::{ChangeType, ClaimChange, ClaimType};
pub use progress::{MemoryProgressStore, PgProgressStore, ProgressStore};
pub use source::{
    ChangeStream, ClaimChangeSource, MemoryClaimSource, NdjsonClaimSource, SourceItem, StreamError,
};
pub use transform::{ClaimTransformer, TransformError, TransformedClaim};
