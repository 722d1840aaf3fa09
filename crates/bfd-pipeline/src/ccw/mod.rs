//! CCW RIF extract loading
//!
//! The CCW drops data sets into the bucket: a manifest plus one file per
//! record type. [`DataSetQueue`] finds the next complete set and downloads it,
//! [`RifFilesEvent`] puts its files in foreign-key-safe order, and
//! [`CcwRifLoadJob`] feeds them to a [`RifFileProcessor`] one at a time.

pub mod event;
pub mod file_type;
pub mod load_job;
pub mod manifest;
pub mod queue;

pub use event::{InMemoryRifFile, LocalRifFile, RifFile, RifFileEvent, RifFilesEvent};
pub use file_type::RifFileType;
pub use load_job::{CcwRifLoadJob, RifFileProcessor, StagingDirProcessor, CCW_RIF_LOAD_JOB};
pub use manifest::{DataSetManifest, ManifestId, ManifestKey};
pub use queue::{DataSetQueue, PendingDataSet};
