//! Object store access for CCW extracts
//!
//! The load job only needs to list, fetch and move objects, so it talks to
//! the [`ObjectStore`] trait. [`S3ObjectStore`] is the production backend,
//! [`MemoryObjectStore`] backs tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod config;
pub mod integrity;
pub mod memory;
pub mod s3;

pub use integrity::{download_verified, RetryPolicy};
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// User metadata key the CCW export stores each object's MD5 under
pub const MD5_METADATA_KEY: &str = "md5chksum";

/// Why fetching an object failed.
///
/// Callers retry [`Transient`](Self::Transient) with the same request,
/// re-download on [`ChecksumMismatch`](Self::ChecksumMismatch) and give up on
/// [`NotFound`](Self::NotFound).
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("transient failure accessing {key}: {source}")]
    Transient {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

impl DownloadError {
    pub fn transient(key: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        DownloadError::Transient {
            key: key.into(),
            source: source.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Transient { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Hex MD5 from the object's user metadata, when the uploader set one
    pub md5: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ObjectData {
    pub info: ObjectInfo,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, DownloadError>;

    /// Metadata only; `Ok(None)` if the object does not exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, DownloadError>;

    async fn get(&self, key: &str) -> Result<ObjectData, DownloadError>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Copy then delete. Not atomic.
    async fn rename(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }
}
