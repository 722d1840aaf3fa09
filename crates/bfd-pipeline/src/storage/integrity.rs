//! Checksum-verified downloads
//!
//! Network trouble and corrupted bytes fail differently and are retried
//! differently: a transient error repeats the same request after a backoff, a
//! checksum mismatch throws the bytes away and downloads again at once.

use super::{DownloadError, ObjectData, ObjectStore};
use bfd_common::checksum::verify_md5;
use bfd_common::BfdError;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per failure kind, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Compare the received bytes against the MD5 the uploader recorded.
///
/// Objects without a recorded digest pass unchecked.
pub fn verify_download(data: &ObjectData) -> Result<(), DownloadError> {
    let Some(expected) = data.info.md5.as_deref() else {
        debug!(key = %data.info.key, "No checksum recorded; skipping verification");
        return Ok(());
    };
    match verify_md5(&data.bytes, expected) {
        Ok(()) => Ok(()),
        Err(BfdError::ChecksumMismatch { expected, actual }) => Err(DownloadError::ChecksumMismatch {
            key: data.info.key.clone(),
            expected,
            actual,
        }),
        Err(other) => Err(DownloadError::transient(data.info.key.clone(), other)),
    }
}

/// Fetch `key` and verify it, retrying per `policy`.
///
/// `NotFound` is returned immediately. Otherwise the last error is returned
/// once its kind has used up `policy.max_attempts`.
#[instrument(skip(store, policy))]
pub async fn download_verified(
    store: &dyn ObjectStore,
    key: &str,
    policy: &RetryPolicy,
) -> Result<ObjectData, DownloadError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut transient_failures = 0;
    let mut mismatches = 0;

    loop {
        let result = match store.get(key).await {
            Ok(data) => verify_download(&data).map(|()| data),
            Err(e) => Err(e),
        };

        match result {
            Ok(data) => return Ok(data),
            Err(e @ DownloadError::NotFound { .. }) => return Err(e),
            Err(e @ DownloadError::Transient { .. }) => {
                transient_failures += 1;
                if transient_failures >= max_attempts {
                    return Err(e);
                }
                let delay = policy.backoff(transient_failures);
                warn!(error = %e, attempt = transient_failures, ?delay, "Transient download failure; retrying");
                tokio::time::sleep(delay).await;
            },
            Err(e @ DownloadError::ChecksumMismatch { .. }) => {
                mismatches += 1;
                if mismatches >= max_attempts {
                    return Err(e);
                }
                warn!(error = %e, attempt = mismatches, "Corrupt download; fetching again");
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::memory::{Fault, MemoryObjectStore};
    use crate::storage::ObjectInfo;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(10), Duration::from_secs(1));
    }

    #[test]
    fn test_verify_without_digest_passes() {
        let data = ObjectData {
            info: ObjectInfo {
                key: "k".into(),
                size: 1,
                md5: None,
                last_modified: None,
            },
            bytes: vec![1],
        };
        assert!(verify_download(&data).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatch_is_redownloaded() {
        let store = MemoryObjectStore::new();
        store.insert("Incoming/a.txt", "beneficiaries").await;
        store.inject("Incoming/a.txt", [Fault::Corrupt]).await;

        let data = download_verified(&store, "Incoming/a.txt", &policy())
            .await
            .unwrap();
        assert_eq!(data.bytes, b"beneficiaries");
        assert_eq!(store.get_count("Incoming/a.txt").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_mismatch_is_reported_as_mismatch() {
        let store = MemoryObjectStore::new();
        store
            .insert_with_md5("k", "data", Some("00000000000000000000000000000000".into()))
            .await;

        let err = download_verified(&store, "k", &policy()).await.unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(!err.is_transient());
        assert_eq!(store.get_count("k").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_back_off_then_succeed() {
        let store = MemoryObjectStore::new();
        store.insert("k", "data").await;
        store.inject("k", [Fault::Transient, Fault::Transient]).await;

        let started = tokio::time::Instant::now();
        let data = download_verified(&store, "k", &policy()).await.unwrap();
        assert_eq!(data.bytes, b"data");
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_attempts() {
        let store = MemoryObjectStore::new();
        store.insert("k", "data").await;
        store.inject("k", [Fault::Transient; 5]).await;

        let err = download_verified(&store, "k", &policy()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.get_count("k").await, 3);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_retried() {
        let store = MemoryObjectStore::new();
        let err = download_verified(&store, "nope", &policy()).await.unwrap_err();
        assert!(matches!(err, DownloadError::NotFound { .. }));
        assert_eq!(store.get_count("nope").await, 1);
    }
}
